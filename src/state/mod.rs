pub mod rooms;
pub mod seats;
pub mod trials;

pub use rooms::RoomRegistry;
pub use seats::{NoSeatsAvailable, SeatAllocator, SeatLayoutConfig};
pub use trials::{TrialStore, TrialStoreError};

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::sync::Mutex;

use crate::protocol::{ConnId, ServerMessage};

pub type WsMessage = hyper_tungstenite::tungstenite::Message;
pub type WsSender = mpsc::UnboundedSender<WsMessage>;

/// Live relay state: room membership, seat occupancy, and the outbound
/// channel of every connected client. Membership and seats share one lock so
/// a disconnect releases the seat and removes the member in a single
/// critical section.
pub struct RelayState {
    pub rooms: RoomRegistry,
    pub seats: SeatAllocator,
    pub senders: HashMap<ConnId, WsSender>,
}

impl RelayState {
    pub fn new() -> Self {
        Self {
            rooms: RoomRegistry::new(),
            seats: SeatAllocator::default(),
            senders: HashMap::new(),
        }
    }

    /// Fan a message out to every member of the room, optionally skipping one
    /// connection. Sends to dead receivers are ignored; their own disconnect
    /// path cleans them up.
    pub fn broadcast(&self, trial_id: &str, msg: &ServerMessage, skip: Option<&str>) {
        let Ok(json) = serde_json::to_string(msg) else {
            return;
        };
        for conn_id in self.rooms.member_ids(trial_id) {
            if skip == Some(conn_id.as_str()) {
                continue;
            }
            if let Some(sender) = self.senders.get(&conn_id) {
                let _ = sender.send(WsMessage::Text(json.clone()));
            }
        }
    }
}

impl Default for RelayState {
    fn default() -> Self {
        Self::new()
    }
}

/// Main application state. The trial store sits behind its own lock so a
/// slow snapshot write never delays presence or pose fan-out.
pub struct AppState {
    pub relay: Arc<Mutex<RelayState>>,
    pub trials: Arc<Mutex<TrialStore>>,
}

impl AppState {
    pub fn new(trials: TrialStore) -> Self {
        Self {
            relay: Arc::new(Mutex::new(RelayState::new())),
            trials: Arc::new(Mutex::new(trials)),
        }
    }
}

pub type SharedState = Arc<AppState>;
