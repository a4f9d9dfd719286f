//! Room membership tracking for the presence channel.
//!
//! Rooms are keyed by name and scoped by a project id. Membership is the
//! union of locally-initiated joins and remotely-reported ones; emptied
//! rooms are pruned. Joins and leaves are optimistic: local state is updated
//! first and the request goes out fire-and-forget, with no acknowledgement
//! awaited.
//!
//! Local membership records persist across reconnects but are not resent to
//! the server unless `rejoin_rooms` is enabled; the document channel resumes
//! its subscriptions, rooms historically did not. See DESIGN.md.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use uuid::Uuid;

use crate::protocol::PresenceFrame;
use crate::router::Outbound;
use crate::supervisor::LinkHooks;

pub struct RoomRegistry {
    local_id: Uuid,
    outbound: Outbound,
    rooms: Mutex<HashMap<u64, HashMap<String, HashSet<Uuid>>>>,
    rejoin_on_reconnect: bool,
}

impl RoomRegistry {
    pub fn new(local_id: Uuid, outbound: Outbound, rejoin_on_reconnect: bool) -> Self {
        Self {
            local_id,
            outbound,
            rooms: Mutex::new(HashMap::new()),
            rejoin_on_reconnect,
        }
    }

    pub fn local_id(&self) -> Uuid {
        self.local_id
    }

    /// Idempotent optimistic join: a no-op when already a member.
    pub fn join(&self, room: &str, project: u64) {
        {
            let mut rooms = self.rooms.lock().unwrap();
            let members = rooms
                .entry(project)
                .or_default()
                .entry(room.to_owned())
                .or_default();
            if !members.insert(self.local_id) {
                return;
            }
        }
        self.send_frame(PresenceFrame::Join {
            room: room.to_owned(),
            project,
            id: self.local_id,
            members: None,
        });
    }

    /// Idempotent optimistic leave: a no-op when not currently a member.
    pub fn leave(&self, room: &str, project: u64) {
        {
            let mut rooms = self.rooms.lock().unwrap();
            let Some(project_rooms) = rooms.get_mut(&project) else { return };
            let Some(members) = project_rooms.get_mut(room) else { return };
            if !members.remove(&self.local_id) {
                return;
            }
            if members.is_empty() {
                project_rooms.remove(room);
            }
            if project_rooms.is_empty() {
                rooms.remove(&project);
            }
        }
        self.send_frame(PresenceFrame::Leave {
            room: room.to_owned(),
            project,
            id: self.local_id,
        });
    }

    /// Merge a remote join/leave notification into the matching room.
    pub fn apply_remote(&self, frame: &PresenceFrame) {
        let mut rooms = self.rooms.lock().unwrap();
        match frame {
            PresenceFrame::Join { room, project, id, members } => {
                let set = rooms
                    .entry(*project)
                    .or_default()
                    .entry(room.clone())
                    .or_default();
                set.insert(*id);
                if let Some(initial) = members {
                    set.extend(initial.iter().copied());
                }
            }
            PresenceFrame::Leave { room, project, id } => {
                let Some(project_rooms) = rooms.get_mut(project) else { return };
                let Some(set) = project_rooms.get_mut(room) else { return };
                set.remove(id);
                if set.is_empty() {
                    project_rooms.remove(room);
                }
                if project_rooms.is_empty() {
                    rooms.remove(project);
                }
            }
        }
    }

    /// Re-send join requests for every room we are locally a member of.
    /// Only runs when `rejoin_rooms` was enabled.
    pub fn rejoin_all(&self) {
        if !self.rejoin_on_reconnect {
            return;
        }
        let joined: Vec<(String, u64)> = {
            let rooms = self.rooms.lock().unwrap();
            rooms
                .iter()
                .flat_map(|(project, by_room)| {
                    by_room
                        .iter()
                        .filter(|(_, members)| members.contains(&self.local_id))
                        .map(|(room, _)| (room.clone(), *project))
                })
                .collect()
        };
        for (room, project) in joined {
            self.send_frame(PresenceFrame::Join {
                room,
                project,
                id: self.local_id,
                members: None,
            });
        }
    }

    pub fn members(&self, room: &str, project: u64) -> HashSet<Uuid> {
        let rooms = self.rooms.lock().unwrap();
        rooms
            .get(&project)
            .and_then(|by_room| by_room.get(room))
            .cloned()
            .unwrap_or_default()
    }

    pub fn room_count(&self, project: u64) -> usize {
        let rooms = self.rooms.lock().unwrap();
        rooms.get(&project).map(HashMap::len).unwrap_or(0)
    }

    fn send_frame(&self, frame: PresenceFrame) {
        match serde_json::to_string(&frame) {
            Ok(text) => {
                let outbound = self.outbound.clone();
                tokio::spawn(async move {
                    if let Err(e) = outbound.send(&text).await {
                        log::warn!("presence send failed: {e}");
                    }
                });
            }
            Err(e) => log::warn!("presence frame encode failed: {e}"),
        }
    }
}

impl LinkHooks for RoomRegistry {
    fn on_resume(&self) {
        self.rejoin_all();
    }
}
