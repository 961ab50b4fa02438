use serde::{de::DeserializeOwned, Deserialize, Serialize};

pub mod edge;
pub mod errors;
pub mod fragment;
pub mod vertex;

/// Blanket bound for vertex and edge attribute types.
///
/// The attribute type of a fragment is fixed at construction time and shared
/// by all of its vertices (respectively edges).
pub trait Payload: Clone + Send + Sync + std::fmt::Debug + 'static {}

impl<T: Clone + Send + Sync + std::fmt::Debug + 'static> Payload for T {}

/// Blanket bound for message payloads: a serializable value.
///
/// The engine never defines a wire encoding itself; the serde bound is the
/// contract a transport may rely on.
pub trait MsgPayload: Payload + Serialize + DeserializeOwned {}

impl<T: Payload + Serialize + DeserializeOwned> MsgPayload for T {}

/// Unit attribute for payload-less fragments.
#[derive(Clone, Copy, Default, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Empty;

impl std::fmt::Display for Empty {
    fn fmt(&self, _f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Ok(())
    }
}
