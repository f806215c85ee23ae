//! Request types and the `Request` capability.

use std::fmt;

use serde::de::DeserializeOwned;
use serde::Serialize;

/// Logical operation identifier, e.g. `contacts.party.create`.
///
/// Used as the handler registry key and as the request topic suffix, so
/// it must be stable and unique per operation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestType {
    segments: Vec<String>,
}

impl RequestType {
    /// Build a request type from its segments.
    pub fn new<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            segments: segments.into_iter().map(Into::into).collect(),
        }
    }

    /// The conventional `module.submodule.action` triple.
    pub fn action(
        module: impl Into<String>,
        submodule: impl Into<String>,
        action: impl Into<String>,
    ) -> Self {
        Self {
            segments: vec![module.into(), submodule.into(), action.into()],
        }
    }

    /// The individual segments.
    pub fn segments(&self) -> &[String] {
        &self.segments
    }
}

impl fmt::Display for RequestType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.segments.join("."))
    }
}

/// A payload that knows which operation it requests.
///
/// `Result` is the value a handler produces for it; callers of
/// [`Bus::request`](crate::bus::Bus::request) receive it directly.
///
/// ```
/// use serde::{Deserialize, Serialize};
/// use sourced_cqrs::{Request, RequestType};
///
/// #[derive(Default, Serialize, Deserialize)]
/// struct CreateParty {
///     name: String,
/// }
///
/// impl Request for CreateParty {
///     type Result = String;
///
///     fn request_type(&self) -> RequestType {
///         RequestType::action("contacts", "party", "create")
///     }
/// }
///
/// assert_eq!(CreateParty::default().request_type().to_string(), "contacts.party.create");
/// ```
pub trait Request: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// What a successful handler returns.
    type Result: Serialize + DeserializeOwned + Send + 'static;

    /// The operation this request targets.
    fn request_type(&self) -> RequestType;
}
