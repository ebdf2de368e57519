//! XDND client messages
//!
//! Every protocol message is a format-32 client message with five data words. The first
//! word always names the sending window, the client message's window field names the
//! receiving one. Fields introduced by later protocol versions are only written when the
//! negotiated version carries them, and are reported as absent when decoding zeros.

use bitflags::bitflags;

use super::{Atoms, DndAction};
use crate::{
    connection::{Atom, ClientMessage, Window, NONE},
    utils::{Point, Rectangle, Timestamp, CURRENT_TIME},
};

bitflags! {
    /// Flags of the second data word of `XdndEnter`
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EnterFlags: u32 {
        /// The source offers more than three types, see `XdndTypeList`
        const MORE_TYPES = 1;
    }

    /// Flags of the second data word of `XdndStatus`
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct StatusFlags: u32 {
        /// The target would accept a drop
        const ACCEPT = 1;
        /// The target wants positions even inside the reported rectangle
        const WANT_POSITION = 2;
    }

    /// Flags of the second data word of `XdndFinished`
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FinishedFlags: u32 {
        /// The drop was performed
        const ACCEPTED = 1;
    }
}

/// A decoded XDND message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XdndMessage {
    /// The pointer entered a window
    Enter {
        /// The drag source
        source: Window,
        /// Protocol version spoken by the source
        version: u32,
        /// Whether the full list has to be read from `XdndTypeList`
        more_types: bool,
        /// The first three offered types, [`NONE`] padded
        types: [Atom; 3],
    },
    /// The pointer moved over the target
    Position {
        /// The drag source
        source: Window,
        /// Pointer location in root coordinates
        point: Point,
        /// Time of the motion, version 1 and up
        time: Timestamp,
        /// The proposed action, version 2 and up
        action: Option<DndAction>,
    },
    /// The target's answer to a position
    Status {
        /// The drop target
        target: Window,
        /// Whether a drop would be accepted
        accept: bool,
        /// Whether the target wants positions inside `rect`
        want_position: bool,
        /// Root relative rectangle the answer stays valid in
        rect: Rectangle,
        /// The accepted action, version 2 and up
        action: Option<DndAction>,
    },
    /// The pointer left the target or the drag was cancelled
    Leave {
        /// The drag source
        source: Window,
    },
    /// The data was dropped
    Drop {
        /// The drag source
        source: Window,
        /// Time of the drop, version 1 and up
        time: Timestamp,
    },
    /// The target is done with the drop
    Finished {
        /// The drop target
        target: Window,
        /// Whether the drop was performed, version 5 and up
        accepted: bool,
        /// The performed action, version 5 and up
        action: Option<DndAction>,
    },
}

impl XdndMessage {
    /// The window that sent the message
    pub fn sender(&self) -> Window {
        match *self {
            XdndMessage::Enter { source, .. }
            | XdndMessage::Position { source, .. }
            | XdndMessage::Leave { source }
            | XdndMessage::Drop { source, .. } => source,
            XdndMessage::Status { target, .. } | XdndMessage::Finished { target, .. } => target,
        }
    }

    /// Decode a client message, `None` if it is not an XDND message
    pub fn decode(message: &ClientMessage, atoms: &Atoms) -> Option<XdndMessage> {
        let data = message.data;
        let action = |atom: Atom| DndAction::from_atom(atom, atoms);
        let decoded = match message.type_ {
            x if x == atoms.XdndEnter => XdndMessage::Enter {
                source: data[0],
                version: data[1] >> 24,
                more_types: EnterFlags::from_bits_truncate(data[1]).contains(EnterFlags::MORE_TYPES),
                types: [data[2], data[3], data[4]],
            },
            x if x == atoms.XdndPosition => XdndMessage::Position {
                source: data[0],
                point: Point::unpack(data[2]),
                time: Timestamp(data[3]),
                action: action(data[4]),
            },
            x if x == atoms.XdndStatus => {
                let flags = StatusFlags::from_bits_truncate(data[1]);
                XdndMessage::Status {
                    target: data[0],
                    accept: flags.contains(StatusFlags::ACCEPT),
                    want_position: flags.contains(StatusFlags::WANT_POSITION),
                    rect: Rectangle::unpack(data[2], data[3]),
                    action: action(data[4]),
                }
            }
            x if x == atoms.XdndLeave => XdndMessage::Leave { source: data[0] },
            x if x == atoms.XdndDrop => XdndMessage::Drop {
                source: data[0],
                time: Timestamp(data[2]),
            },
            x if x == atoms.XdndFinished => XdndMessage::Finished {
                target: data[0],
                accepted: FinishedFlags::from_bits_truncate(data[1]).contains(FinishedFlags::ACCEPTED),
                action: action(data[2]),
            },
            _ => return None,
        };
        Some(decoded)
    }

    /// Encode the message for `destination`, leaving out fields `version` does not know
    pub fn encode(&self, destination: Window, atoms: &Atoms, version: u32) -> ClientMessage {
        let action = |action: Option<DndAction>| action.map(|a| a.to_atom(atoms)).unwrap_or(NONE);
        let mut data = [0u32; 5];
        let type_ = match *self {
            XdndMessage::Enter {
                source,
                version: announced,
                more_types,
                types,
            } => {
                let flags = if more_types {
                    EnterFlags::MORE_TYPES
                } else {
                    EnterFlags::empty()
                };
                data[0] = source;
                data[1] = flags.bits() | (announced << 24);
                data[2..5].copy_from_slice(&types);
                atoms.XdndEnter
            }
            XdndMessage::Position {
                source,
                point,
                time,
                action: proposed,
            } => {
                data[0] = source;
                data[2] = point.pack();
                if version >= 1 {
                    data[3] = time.0;
                }
                if version >= 2 {
                    data[4] = action(proposed);
                }
                atoms.XdndPosition
            }
            XdndMessage::Status {
                target,
                accept,
                want_position,
                rect,
                action: accepted,
            } => {
                let mut flags = StatusFlags::empty();
                flags.set(StatusFlags::ACCEPT, accept);
                flags.set(StatusFlags::WANT_POSITION, want_position);
                let [loc, size] = rect.pack();
                data[0] = target;
                data[1] = flags.bits();
                data[2] = loc;
                data[3] = size;
                if version >= 2 && accept {
                    data[4] = action(accepted);
                }
                atoms.XdndStatus
            }
            XdndMessage::Leave { source } => {
                data[0] = source;
                atoms.XdndLeave
            }
            XdndMessage::Drop { source, time } => {
                data[0] = source;
                data[2] = if version >= 1 { time.0 } else { CURRENT_TIME.0 };
                atoms.XdndDrop
            }
            XdndMessage::Finished {
                target,
                accepted,
                action: performed,
            } => {
                data[0] = target;
                if version >= 5 && accepted {
                    data[1] = FinishedFlags::ACCEPTED.bits();
                    data[2] = action(performed);
                }
                atoms.XdndFinished
            }
        };

        ClientMessage {
            window: destination,
            type_,
            data,
        }
    }
}
