use serde::{Deserialize, Deserializer};

/// Login, registration and profile payloads.
pub mod auth;
/// Room entities carried by the room socket.
pub mod room;
/// Subscription status polled after checkout.
pub mod subscription;
/// Form validation rules and backend error mapping.
pub mod validation;
/// Room socket message envelopes.
pub mod ws;

/// Accept identifiers the backend serialises either as strings or integers.
fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Number(i64),
    }

    Ok(match Raw::deserialize(deserializer)? {
        Raw::Text(text) => text,
        Raw::Number(number) => number.to_string(),
    })
}
