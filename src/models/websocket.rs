use serde::{ Serialize, Deserialize };

use super::chat::{ Chat, DisplayMessage };
use super::profile::BusinessProfile;

#[derive(Serialize, Deserialize, Debug)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    OpenChat {
        chat_id: String,
    },
    NewChat,
    Send {
        content: String,
    },
    SelectProfile {
        #[serde(default)]
        profile_id: Option<String>,
    },
    SelectFramework {
        framework: String,
    },
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    ChatLoaded {
        chat: Chat,
        messages: Vec<DisplayMessage>,
    },
    Message {
        message: DisplayMessage,
    },
    Reconciled {
        temp_id: String,
        message: DisplayMessage,
    },
    Generating {
        active: bool,
    },
    ProfileSelected {
        profile: Option<BusinessProfile>,
    },
    Error {
        message: String,
    },
    SessionReset,
}
