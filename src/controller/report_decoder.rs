//! Report decoding
//!
//! Maps one raw controller report to a [`ControllerEvent`]. The first byte of
//! the report carries the command code, the third byte the pad/knob number
//! and the fourth byte the velocity or knob value.

use tracing::warn;

use super::event::{ControllerEvent, Report};

pub const CMD_PAD_UP: u8 = 8;
pub const CMD_PAD_DOWN: u8 = 9;
pub const CMD_POT_CHANGE: u8 = 11;
pub const CMD_PROGRAM_CHANGE: u8 = 12;

/// Decodes a single report.
///
/// Returns `None` for any command code other than the four known ones; the
/// raw report is logged so unknown traffic can be inspected.
pub fn decode(report: &Report) -> Option<ControllerEvent> {
    let id = report.target();
    match report.command() {
        CMD_PAD_DOWN => Some(ControllerEvent::PadDown {
            id,
            velocity: report.payload(),
        }),
        CMD_PAD_UP => Some(ControllerEvent::PadUp { id }),
        CMD_PROGRAM_CHANGE => Some(ControllerEvent::ProgramChange { id }),
        CMD_POT_CHANGE => Some(ControllerEvent::PotChange {
            id,
            value: report.payload(),
        }),
        code => {
            warn!("Ignoring report with unknown command code {}: {:?}", code, report);
            None
        }
    }
}
