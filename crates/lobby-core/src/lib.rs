//! Shared types for the lobby presence server: identifiers, the session
//! record, declarative auth policies and the wire protocol.

pub mod errors;
pub mod ids;
pub mod policy;
pub mod protocol;
pub mod session;

pub use errors::HandlerError;
pub use ids::{ConnectionId, Token};
pub use policy::{AuthPolicy, FieldType, FieldValue, Rule, Verdict};
pub use session::{Location, Session};
