//! Display connection abstraction
//!
//! The XDND engine does not talk to the X server directly. Everything it needs from the
//! display, window properties, client messages, the selection mechanism, window tree
//! queries and the pointer grab, goes through the [`DisplayConnection`] trait.
//!
//! Two implementations are provided:
//!
//! - [`x11rb::X11Connection`] (feature `backend_x11`) drives a real X server through `x11rb`.
//! - [`dummy::DummyServer`] (feature `backend_dummy`) is an in-memory display server with
//!   multiple client connections, intended for tests.
//!
//! Input is handed to the engine as [`Event`]s, which the host has to obtain from its
//! own event loop.

use crate::utils::{Point, Rectangle, Timestamp};

#[cfg(feature = "backend_dummy")]
pub mod dummy;
#[cfg(feature = "backend_x11")]
pub mod x11rb;

/// Identifier of an X11 window
pub type Window = u32;
/// Identifier of an interned X11 atom
pub type Atom = u32;
/// Identifier of an X11 cursor resource
pub type Cursor = u32;

/// The `None` resource / atom
pub const NONE: u32 = 0;

/// Atoms predefined by the X11 core protocol
pub mod predefined {
    use super::Atom;

    /// `AnyPropertyType`, matches any property type
    pub const ANY: Atom = 0;
    /// `ATOM`
    pub const ATOM: Atom = 4;
    /// `CARDINAL`
    pub const CARDINAL: Atom = 6;
    /// `STRING`
    pub const STRING: Atom = 31;
    /// `WINDOW`
    pub const WINDOW: Atom = 33;

    /// Names of the predefined atoms used by this crate
    pub const NAMES: &[(&str, Atom)] = &[("ATOM", ATOM), ("CARDINAL", CARDINAL), ("STRING", STRING), ("WINDOW", WINDOW)];
}

/// Errors of a [`DisplayConnection`]
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    /// A request referenced a window that does not exist
    #[error("Window {0} does not exist")]
    BadWindow(Window),
    /// A request referenced an atom that does not exist
    #[error("Atom {0} does not exist")]
    BadAtom(Atom),
    /// A request was malformed
    #[error("Invalid request: {0}")]
    BadRequest(&'static str),
    /// Connecting to the X server failed
    #[cfg(feature = "backend_x11")]
    #[error("Connecting to the X server failed")]
    ConnectFailed(#[from] ::x11rb::errors::ConnectError),
    /// Some protocol error occurred on an x11rb connection
    #[cfg(feature = "backend_x11")]
    #[error(transparent)]
    X11(#[from] ::x11rb::errors::ReplyOrIdError),
}

/// Reply of a `GetProperty` request
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PropertyReply {
    /// Type of the property, [`NONE`] if the property does not exist
    pub type_: Atom,
    /// Format of the property: 8, 16 or 32
    pub format: u8,
    /// Raw property data of the requested range
    pub value: Vec<u8>,
    /// Number of bytes left after the requested range
    pub bytes_after: u32,
}

impl PropertyReply {
    /// Whether the requested property does not exist
    pub fn is_none(&self) -> bool {
        self.type_ == NONE
    }

    /// Iterate over the property as 32-bit values
    ///
    /// Returns `None` if the property has a different format.
    pub fn value32(&self) -> Option<impl Iterator<Item = u32> + '_> {
        if self.format != 32 {
            return None;
        }
        Some(
            self.value
                .chunks_exact(4)
                .map(|chunk| u32::from_ne_bytes([chunk[0], chunk[1], chunk[2], chunk[3]])),
        )
    }
}

/// State change reported by a [`PropertyNotify`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PropertyState {
    /// The property was changed or created
    NewValue,
    /// The property was deleted
    Deleted,
}

/// A format-32 client message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientMessage {
    /// The window the message is about
    pub window: Window,
    /// Type of the message
    pub type_: Atom,
    /// Message data
    pub data: [u32; 5],
}

/// Pointer motion, in root coordinates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MotionEvent {
    /// Pointer location relative to the root window
    pub root: Point,
    /// Server time of the event
    pub time: Timestamp,
}

/// Pointer button release, in root coordinates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ButtonEvent {
    /// Pointer location relative to the root window
    pub root: Point,
    /// The released button
    pub button: u8,
    /// Server time of the event
    pub time: Timestamp,
}

/// Another client asks the selection owner to convert a selection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SelectionRequest {
    /// The owner the request was delivered to
    pub owner: Window,
    /// The requesting window
    pub requestor: Window,
    /// The selection to convert
    pub selection: Atom,
    /// The requested target type
    pub target: Atom,
    /// The property the data should be stored in
    pub property: Atom,
    /// Timestamp of the request
    pub time: Timestamp,
}

/// Answer to a `ConvertSelection` request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SelectionNotify {
    /// The requesting window
    pub requestor: Window,
    /// The converted selection
    pub selection: Atom,
    /// The requested target type
    pub target: Atom,
    /// The property holding the data, or [`NONE`] if the conversion failed
    pub property: Atom,
    /// Timestamp of the original request
    pub time: Timestamp,
}

/// A window property changed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PropertyNotify {
    /// The window owning the property
    pub window: Window,
    /// The property
    pub atom: Atom,
    /// Kind of change
    pub state: PropertyState,
    /// Server time of the change
    pub time: Timestamp,
}

/// Part of a window needs to be redrawn
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExposeEvent {
    /// The exposed window
    pub window: Window,
    /// The exposed area, window relative
    pub area: Rectangle,
    /// Number of expose events following this one
    pub count: u16,
}

/// Events the XDND engine reacts to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// Pointer motion
    Motion(MotionEvent),
    /// A pointer button was released
    ButtonRelease(ButtonEvent),
    /// A client message was received
    ClientMessage(ClientMessage),
    /// A selection conversion was requested from us
    SelectionRequest(SelectionRequest),
    /// A selection conversion we requested was answered
    SelectionNotify(SelectionNotify),
    /// A property on a window we listen to changed
    PropertyNotify(PropertyNotify),
    /// A window needs to be redrawn
    Expose(ExposeEvent),
}

impl Event {
    /// Server timestamp carried by the event, if any
    ///
    /// Client messages carry their timestamps in protocol specific fields and report `None`.
    pub fn time(&self) -> Option<Timestamp> {
        let time = match self {
            Event::Motion(ev) => ev.time,
            Event::ButtonRelease(ev) => ev.time,
            Event::SelectionRequest(ev) => ev.time,
            Event::SelectionNotify(ev) => ev.time,
            Event::PropertyNotify(ev) => ev.time,
            Event::ClientMessage(_) | Event::Expose(_) => return None,
        };
        (!time.is_current_time()).then_some(time)
    }
}

/// Requests the XDND engine needs from the display server
///
/// Methods take `&self`, implementations are expected to use interior mutability where
/// needed, just like an x11rb connection does.
pub trait DisplayConnection {
    /// The root window of the screen drags happen on
    fn root(&self) -> Window;

    /// Intern an atom, creating it if it does not exist
    fn intern_atom(&self, name: &str) -> Result<Atom, ConnectionError>;

    /// Look up the name of an atom
    fn atom_name(&self, atom: Atom) -> Result<String, ConnectionError>;

    /// Read a property
    ///
    /// `long_offset` and `long_length` are counted in 32-bit units as in the core protocol.
    /// A non-existing property is reported with a type of [`NONE`].
    fn get_property(
        &self,
        window: Window,
        property: Atom,
        type_: Atom,
        long_offset: u32,
        long_length: u32,
    ) -> Result<PropertyReply, ConnectionError>;

    /// Replace a property
    fn change_property(
        &self,
        window: Window,
        property: Atom,
        type_: Atom,
        format: u8,
        data: &[u8],
    ) -> Result<(), ConnectionError>;

    /// Delete a property
    fn delete_property(&self, window: Window, property: Atom) -> Result<(), ConnectionError>;

    /// Send a client message to `destination` without any event mask
    fn send_client_message(&self, destination: Window, message: ClientMessage) -> Result<(), ConnectionError>;

    /// Set the owner of a selection
    fn set_selection_owner(&self, owner: Window, selection: Atom, time: Timestamp) -> Result<(), ConnectionError>;

    /// Query the owner of a selection, [`NONE`] if there is none
    fn selection_owner(&self, selection: Atom) -> Result<Window, ConnectionError>;

    /// Ask the selection owner to convert a selection into `property` on `requestor`
    fn convert_selection(
        &self,
        requestor: Window,
        selection: Atom,
        target: Atom,
        property: Atom,
        time: Timestamp,
    ) -> Result<(), ConnectionError>;

    /// Answer a [`SelectionRequest`]
    fn send_selection_notify(&self, notify: SelectionNotify) -> Result<(), ConnectionError>;

    /// Translate `point` from `src` into `dst` coordinates
    ///
    /// Also returns the direct child of `dst` containing the point, or [`NONE`].
    /// Returns `None` if the windows are on different screens.
    fn translate_coordinates(
        &self,
        src: Window,
        dst: Window,
        point: Point,
    ) -> Result<Option<(Point, Window)>, ConnectionError>;

    /// The parent of a window, `None` for the root window
    fn parent(&self, window: Window) -> Result<Option<Window>, ConnectionError>;

    /// Start listening to property changes on a window
    fn select_property_events(&self, window: Window) -> Result<(), ConnectionError>;

    /// Actively grab the pointer for `window`, returns whether the grab succeeded
    fn grab_pointer(&self, window: Window, cursor: Option<Cursor>, time: Timestamp)
        -> Result<bool, ConnectionError>;

    /// Release an active pointer grab
    fn ungrab_pointer(&self, time: Timestamp) -> Result<(), ConnectionError>;

    /// Change the cursor of an active pointer grab
    fn change_grab_cursor(&self, cursor: Option<Cursor>, time: Timestamp) -> Result<(), ConnectionError>;

    /// Take the first pending property notification for `property` on `window`
    ///
    /// Other pending events must stay queued for the host.
    fn take_property_notify(
        &self,
        window: Window,
        property: Atom,
    ) -> Result<Option<PropertyNotify>, ConnectionError>;

    /// Flush pending requests
    fn flush(&self) -> Result<(), ConnectionError>;

    /// Replace a property with format-32 data
    fn change_property32(
        &self,
        window: Window,
        property: Atom,
        type_: Atom,
        data: &[u32],
    ) -> Result<(), ConnectionError> {
        let bytes = data.iter().flat_map(|value| value.to_ne_bytes()).collect::<Vec<u8>>();
        self.change_property(window, property, type_, 32, &bytes)
    }

    /// Replace a property with format-8 data
    fn change_property8(
        &self,
        window: Window,
        property: Atom,
        type_: Atom,
        data: &[u8],
    ) -> Result<(), ConnectionError> {
        self.change_property(window, property, type_, 8, data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn value32_requires_format_32() {
        let reply = PropertyReply {
            type_: predefined::ATOM,
            format: 8,
            value: vec![1, 0, 0, 0],
            bytes_after: 0,
        };
        assert!(reply.value32().is_none());

        let reply = PropertyReply {
            format: 32,
            value: [5u32, 7].iter().flat_map(|v| v.to_ne_bytes()).collect(),
            ..reply
        };
        assert_eq!(reply.value32().unwrap().collect::<Vec<_>>(), vec![5, 7]);
    }

    #[test]
    fn event_time_skips_current_time() {
        let event = Event::Motion(MotionEvent {
            root: Point::new(0, 0),
            time: Timestamp(0),
        });
        assert_eq!(event.time(), None);

        let event = Event::PropertyNotify(PropertyNotify {
            window: 1,
            atom: 2,
            state: PropertyState::Deleted,
            time: Timestamp(42),
        });
        assert_eq!(event.time(), Some(Timestamp(42)));
    }
}
