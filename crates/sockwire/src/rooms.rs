//! Room membership of a namespace and broadcast target resolution.
use std::{
    borrow::Cow,
    collections::{HashMap, HashSet},
    sync::{PoisonError, RwLock},
};

use sockwire_core::Sid;

/// A room identifier
pub type Room = Cow<'static, str>;

/// A trait for types that can be used as a room parameter.
///
/// [`String`], [`Vec<String>`], [`Vec<&str>`], [`&'static str`](str) and const arrays are implemented by default.
pub trait RoomParam: 'static {
    /// The type of the iterator returned by `into_room_iter`.
    type IntoIter: Iterator<Item = Room>;

    /// Convert `self` into an iterator of rooms.
    fn into_room_iter(self) -> Self::IntoIter;
}

impl RoomParam for Room {
    type IntoIter = std::iter::Once<Room>;
    #[inline(always)]
    fn into_room_iter(self) -> Self::IntoIter {
        std::iter::once(self)
    }
}
impl RoomParam for String {
    type IntoIter = std::iter::Once<Room>;
    #[inline(always)]
    fn into_room_iter(self) -> Self::IntoIter {
        std::iter::once(Cow::Owned(self))
    }
}
impl RoomParam for Vec<String> {
    type IntoIter = std::iter::Map<std::vec::IntoIter<String>, fn(String) -> Room>;
    #[inline(always)]
    fn into_room_iter(self) -> Self::IntoIter {
        self.into_iter().map(Cow::Owned)
    }
}
impl RoomParam for Vec<&'static str> {
    type IntoIter = std::iter::Map<std::vec::IntoIter<&'static str>, fn(&'static str) -> Room>;
    #[inline(always)]
    fn into_room_iter(self) -> Self::IntoIter {
        self.into_iter().map(Cow::Borrowed)
    }
}
impl RoomParam for Vec<Room> {
    type IntoIter = std::vec::IntoIter<Room>;
    #[inline(always)]
    fn into_room_iter(self) -> Self::IntoIter {
        self.into_iter()
    }
}
impl RoomParam for &'static str {
    type IntoIter = std::iter::Once<Room>;
    #[inline(always)]
    fn into_room_iter(self) -> Self::IntoIter {
        std::iter::once(Cow::Borrowed(self))
    }
}
impl<const COUNT: usize> RoomParam for [&'static str; COUNT] {
    type IntoIter =
        std::iter::Map<std::array::IntoIter<&'static str, COUNT>, fn(&'static str) -> Room>;
    #[inline(always)]
    fn into_room_iter(self) -> Self::IntoIter {
        self.into_iter().map(Cow::Borrowed)
    }
}
impl<const COUNT: usize> RoomParam for [String; COUNT] {
    type IntoIter = std::iter::Map<std::array::IntoIter<String, COUNT>, fn(String) -> Room>;
    #[inline(always)]
    fn into_room_iter(self) -> Self::IntoIter {
        self.into_iter().map(Cow::Owned)
    }
}
/// A socket id is the name of the room holding only this socket.
impl RoomParam for Sid {
    type IntoIter = std::iter::Once<Room>;
    #[inline(always)]
    fn into_room_iter(self) -> Self::IntoIter {
        std::iter::once(Cow::Owned(self.to_string()))
    }
}

/// The sockets selected by a broadcast.
#[derive(Debug, Clone, Default)]
pub struct BroadcastOptions {
    /// Select the members of these rooms. Every socket of the namespace if empty.
    pub rooms: HashSet<Room>,
    /// Remove the members of these rooms.
    pub except: HashSet<Room>,
    /// The socket initiating the broadcast.
    pub sid: Option<Sid>,
    /// Whether the initiating socket is excluded.
    pub broadcast: bool,
}

/// The room table of a namespace.
#[derive(Debug, Default)]
pub(crate) struct RoomTable {
    rooms: RwLock<HashMap<Room, HashSet<Sid>>>,
}

impl RoomTable {
    /// Adds the socket to all the rooms.
    pub fn add_all(&self, sid: Sid, rooms: impl RoomParam) {
        let mut rooms_map = self.rooms.write().unwrap_or_else(PoisonError::into_inner);
        for room in rooms.into_room_iter() {
            rooms_map.entry(room).or_default().insert(sid);
        }
    }

    /// Removes the socket from the rooms. Empty rooms are dropped.
    pub fn del(&self, sid: Sid, rooms: impl RoomParam) {
        let mut rooms_map = self.rooms.write().unwrap_or_else(PoisonError::into_inner);
        for room in rooms.into_room_iter() {
            if let Some(members) = rooms_map.get_mut(&room) {
                members.remove(&sid);
                if members.is_empty() {
                    rooms_map.remove(&room);
                }
            }
        }
    }

    /// Removes the socket from all the rooms.
    pub fn del_all(&self, sid: Sid) {
        let mut rooms_map = self.rooms.write().unwrap_or_else(PoisonError::into_inner);
        rooms_map.retain(|_, members| {
            members.remove(&sid);
            !members.is_empty()
        });
    }

    /// Returns the rooms of the socket.
    pub fn socket_rooms(&self, sid: Sid) -> Vec<Room> {
        let rooms_map = self.rooms.read().unwrap_or_else(PoisonError::into_inner);
        rooms_map
            .iter()
            .filter(|(_, members)| members.contains(&sid))
            .map(|(room, _)| room.clone())
            .collect()
    }

    /// Returns all the rooms with at least one member.
    pub fn rooms(&self) -> Vec<Room> {
        let rooms_map = self.rooms.read().unwrap_or_else(PoisonError::into_inner);
        rooms_map.keys().cloned().collect()
    }

    /// Removes every room.
    pub fn clear(&self) {
        self.rooms
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Returns the sockets that match the [`BroadcastOptions`].
    ///
    /// `all` gives every socket of the namespace, it is only called when no room is selected.
    pub fn apply_opts(&self, opts: &BroadcastOptions, all: impl FnOnce() -> Vec<Sid>) -> Vec<Sid> {
        let mut selected: HashSet<Sid> = if !opts.rooms.is_empty() {
            let rooms_map = self.rooms.read().unwrap_or_else(PoisonError::into_inner);
            opts.rooms
                .iter()
                .filter_map(|room| rooms_map.get(room))
                .flatten()
                .copied()
                .collect()
        } else if opts.broadcast || opts.sid.is_none() {
            all().into_iter().collect()
        } else {
            // A socket without any operator only targets itself
            opts.sid.into_iter().collect()
        };

        if !opts.except.is_empty() {
            let rooms_map = self.rooms.read().unwrap_or_else(PoisonError::into_inner);
            for room in &opts.except {
                if let Some(members) = rooms_map.get(room) {
                    selected.retain(|sid| !members.contains(sid));
                }
            }
        }
        if opts.broadcast {
            if let Some(sid) = &opts.sid {
                selected.remove(sid);
            }
        }
        selected.into_iter().collect()
    }
}
