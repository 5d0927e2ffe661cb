//! Recordings: ordered command lists captured from a terminal, persisted in a
//! JSON store and replayed by [`crate::playback`].

pub mod capture;
pub mod model;
pub mod store;
