//! Wire formats for the voice service.
//!
//! [`directive`] and [`event`] define the JSON envelopes exchanged with the
//! service, [`multipart`] decodes the MIME bodies the events endpoint
//! returns.

pub mod directive;
pub mod event;
pub mod multipart;
