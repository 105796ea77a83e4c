mod delivery;
mod dispatcher;
mod hub;
mod signing;

pub use delivery::{DeliveryAttempt, DeliveryWorker};
pub use dispatcher::{dispatch, holder_exit_payload, holder_new_payload, k_change_payload};
pub use hub::{BroadcastHub, ConnectionGuard};
pub use signing::{ct_eq, sign_payload_hex, verify_signature_hex};
