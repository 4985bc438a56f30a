//! Device actions
//!
//! Operator commands mapped onto the REST API:
//! - Node properties: mixer channel, media file path, any property
//! - Node functions: transition, any function
//! - Playout buttons of rundown and template items
//! - On-demand property reads for feedbacks

mod device;

pub use device::{
    default_media_directory, function_id, ActionReport, DeviceActions, MixerChannel,
    FEEDBACK_MEDIA_FILE_PATH, FEEDBACK_MIXER_CHANNEL,
};
