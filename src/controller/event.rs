use std::fmt;

/// Size of one raw report read from the controller's input endpoint
pub const REPORT_SIZE: usize = 64;

/// One fixed-size raw report as delivered by the hardware
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Report([u8; REPORT_SIZE]);

impl Report {
    pub fn new(bytes: [u8; REPORT_SIZE]) -> Self {
        Self(bytes)
    }

    /// Builds a report from a transfer buffer, zero-padding short transfers.
    /// Bytes beyond `REPORT_SIZE` are dropped.
    pub fn from_slice(data: &[u8]) -> Self {
        let mut bytes = [0u8; REPORT_SIZE];
        let len = data.len().min(REPORT_SIZE);
        bytes[..len].copy_from_slice(&data[..len]);
        Self(bytes)
    }

    pub fn command(&self) -> u8 {
        self.0[0]
    }

    pub fn target(&self) -> u8 {
        self.0[2]
    }

    pub fn payload(&self) -> u8 {
        self.0[3]
    }

    pub fn as_bytes(&self) -> &[u8; REPORT_SIZE] {
        &self.0
    }
}

impl fmt::Debug for Report {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Report({:?})", &self.0[..])
    }
}

// Decoded controller event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControllerEvent {
    PadDown { id: u8, velocity: u8 },
    PadUp { id: u8 },
    ProgramChange { id: u8 },
    PotChange { id: u8, value: u8 },
}

impl ControllerEvent {
    pub fn id(&self) -> u8 {
        match *self {
            ControllerEvent::PadDown { id, .. }
            | ControllerEvent::PadUp { id }
            | ControllerEvent::ProgramChange { id }
            | ControllerEvent::PotChange { id, .. } => id,
        }
    }

    /// Short kind label used in the published message
    pub fn kind(&self) -> &'static str {
        match self {
            ControllerEvent::PadDown { .. } => "down",
            ControllerEvent::PadUp { .. } => "up",
            ControllerEvent::ProgramChange { .. } => "prog_change",
            ControllerEvent::PotChange { .. } => "pot",
        }
    }
}

/// Renders the single-line message published to the broker
impl fmt::Display for ControllerEvent {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "id={} evt={}", self.id(), self.kind())?;
        match self {
            ControllerEvent::PadDown { velocity, .. } => write!(f, " vel={}", velocity),
            ControllerEvent::PotChange { value, .. } => write!(f, " v={}", value),
            ControllerEvent::PadUp { .. } | ControllerEvent::ProgramChange { .. } => Ok(()),
        }
    }
}
