use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One of the two symmetric player roles handed out after connecting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Seat {
    X,
    O,
}

impl Seat {
    pub fn other(self) -> Seat {
        match self {
            Seat::X => Seat::O,
            Seat::O => Seat::X,
        }
    }

    /// Uniform draw; the caller keeps the result and sends `other()`.
    pub fn draw<R: Rng + ?Sized>(rng: &mut R) -> Seat {
        if rng.gen_bool(0.5) {
            Seat::X
        } else {
            Seat::O
        }
    }
}

/// Application traffic carried over an established channel.
///
/// Game payloads are opaque to this crate; only the tag is fixed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum AppMessage {
    RoleAssign {
        role: Seat,
    },
    GameState {
        state: Value,
    },
    GameSelect {
        game: Option<String>,
        #[serde(rename = "initialState", default)]
        initial_state: Option<Value>,
    },
}
