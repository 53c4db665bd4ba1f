//! Delivery collaborators — template rendering, mail transport, webhook
//! normalization, and bounce/reply detection contracts for the outreach
//! execution engine.

pub mod detection;
pub mod templates;
pub mod transport;
pub mod webhook;

pub use detection::{DetectionSource, StaticDetectionSource};
pub use templates::{InMemoryTemplateRenderer, RenderedEmail, TemplateRenderer};
pub use transport::{
    LoggingTransport, MailTransport, MockTransport, OutboundEmail, TransportError,
    TransportReceipt,
};
