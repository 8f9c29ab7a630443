//! Engine-facing layer: the raw media engine contract, the bundled local
//! engine and the adapter that normalizes engine callbacks for the session.

pub(crate) mod engine;
pub(crate) mod local_engine;
pub(crate) mod player_adapter;
