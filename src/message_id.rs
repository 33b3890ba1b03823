use chrono::Utc;
use uuid::Uuid;

/// Separator between the sender identity and the rest of a message id.
pub const MESSAGE_ID_SEPARATOR: &str = ":::";

/// Build a fresh id: `<identity>:::<unix seconds with micros><uuid v4>`.
pub fn generate_message_id(identity: &str) -> String {
    let micros = Utc::now().timestamp_micros();
    format!(
        "{identity}{MESSAGE_ID_SEPARATOR}{}.{:06}{}",
        micros.div_euclid(1_000_000),
        micros.rem_euclid(1_000_000),
        Uuid::new_v4()
    )
}
