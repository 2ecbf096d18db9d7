//! Live voice broadcast: microphone → canonical PCM → chunked HTTP upload,
//! plus ordered playback of received PCM chunks.

pub mod audio;
pub mod config;
pub mod pipeline;
pub mod stream;

#[cfg(test)]
pub(crate) mod testing;
