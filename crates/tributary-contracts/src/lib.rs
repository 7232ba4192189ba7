//! Host-facing contracts shared by the Tributary pipes: the event envelope,
//! chat message records, valve configuration and the image prompt helpers.

pub mod events;
pub mod image;
pub mod messages;
pub mod valves;
