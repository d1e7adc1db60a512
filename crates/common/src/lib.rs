pub mod error;
pub mod message;
pub mod registration;
pub mod status;

pub use error::{Error, Result};
pub use message::{QueueMessage, DEVICE_REGISTRATIONS_TOPIC};
pub use registration::{DeviceRegistration, RegistrationPayload, TransitionDetails};
pub use status::RegistrationStatus;
