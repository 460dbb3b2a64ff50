// src/audio/backend/mod.rs
// Hardware backends implementing the PCM traits

#[cfg(all(feature = "alsa", target_os = "linux"))]
pub mod alsa;
pub mod cpal;
pub mod memory;

#[cfg(all(feature = "alsa", target_os = "linux"))]
pub use self::alsa::AlsaBackend;
pub use self::cpal::CpalBackend;
pub use self::memory::{MemoryBackend, MemoryCardHandle, MemoryCardSpec};
