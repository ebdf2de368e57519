//! [`DisplayConnection`] implementation on top of an x11rb [`RustConnection`].

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
};

use tracing::{debug, trace};
use x11rb::{
    connection::Connection as _,
    errors::{ConnectionError as X11ConnectionError, ReplyError},
    protocol::{
        xproto::{
            ChangeWindowAttributesAux, ClientMessageEvent, ConnectionExt as _, EventMask, GrabMode,
            GrabStatus, Property, PropMode, SelectionNotifyEvent, SELECTION_NOTIFY_EVENT,
        },
        ErrorKind, Event as X11Event,
    },
    rust_connection::RustConnection,
};

use super::{
    Atom, ButtonEvent, ClientMessage, ConnectionError, Cursor, DisplayConnection, Event, ExposeEvent,
    MotionEvent, PropertyNotify, PropertyReply, PropertyState, SelectionNotify, SelectionRequest, Window,
    NONE,
};
use crate::utils::{Point, Rectangle, Timestamp};

impl From<X11ConnectionError> for ConnectionError {
    fn from(err: X11ConnectionError) -> Self {
        ConnectionError::X11(err.into())
    }
}

impl From<ReplyError> for ConnectionError {
    fn from(err: ReplyError) -> Self {
        match err {
            ReplyError::X11Error(ref x11) if x11.error_kind == ErrorKind::Window => {
                ConnectionError::BadWindow(x11.bad_value)
            }
            ReplyError::X11Error(ref x11) if x11.error_kind == ErrorKind::Atom => ConnectionError::BadAtom(x11.bad_value),
            err => ConnectionError::X11(err.into()),
        }
    }
}

/// A connection to a real X server
///
/// Events read while looking for property notifications (see
/// [`DisplayConnection::take_property_notify`]) are kept in a backlog, retrieve them through
/// [`X11Connection::poll_for_event`] or [`X11Connection::wait_for_event`] instead of reading
/// the underlying [`RustConnection`] directly.
#[derive(Debug)]
pub struct X11Connection {
    conn: Arc<RustConnection>,
    root: Window,
    backlog: Mutex<VecDeque<X11Event>>,
}

impl X11Connection {
    /// Connect to the X server named by `display_name` or `$DISPLAY`
    pub fn connect(display_name: Option<&str>) -> Result<Self, ConnectionError> {
        let (conn, screen_num) = x11rb::connect(display_name)?;
        Ok(Self::new(Arc::new(conn), screen_num))
    }

    /// Wrap an existing connection, using the root window of screen `screen_num`
    pub fn new(conn: Arc<RustConnection>, screen_num: usize) -> Self {
        let root = conn.setup().roots[screen_num].root;
        debug!(root, screen_num, "XDND display connection initialized");
        X11Connection {
            conn,
            root,
            backlog: Mutex::new(VecDeque::new()),
        }
    }

    /// The underlying x11rb connection
    pub fn connection(&self) -> &Arc<RustConnection> {
        &self.conn
    }

    /// Return the next event, if one is available without blocking
    pub fn poll_for_event(&self) -> Result<Option<X11Event>, ConnectionError> {
        if let Some(event) = self.backlog.lock().unwrap().pop_front() {
            return Ok(Some(event));
        }
        Ok(self.conn.poll_for_event()?)
    }

    /// Return the next event, blocking until one arrives
    pub fn wait_for_event(&self) -> Result<X11Event, ConnectionError> {
        if let Some(event) = self.backlog.lock().unwrap().pop_front() {
            return Ok(event);
        }
        Ok(self.conn.wait_for_event()?)
    }
}

/// Translate an x11rb event into an engine [`Event`]
///
/// Returns `None` for events the XDND engine does not care about.
pub fn convert_event(event: &X11Event) -> Option<Event> {
    let event = match event {
        X11Event::MotionNotify(ev) => Event::Motion(MotionEvent {
            root: Point::new(i32::from(ev.root_x), i32::from(ev.root_y)),
            time: Timestamp(ev.time),
        }),
        X11Event::ButtonRelease(ev) => Event::ButtonRelease(ButtonEvent {
            root: Point::new(i32::from(ev.root_x), i32::from(ev.root_y)),
            button: ev.detail,
            time: Timestamp(ev.time),
        }),
        X11Event::ClientMessage(ev) if ev.format == 32 => Event::ClientMessage(ClientMessage {
            window: ev.window,
            type_: ev.type_,
            data: ev.data.as_data32(),
        }),
        X11Event::SelectionRequest(ev) => Event::SelectionRequest(SelectionRequest {
            owner: ev.owner,
            requestor: ev.requestor,
            selection: ev.selection,
            target: ev.target,
            property: ev.property,
            time: Timestamp(ev.time),
        }),
        X11Event::SelectionNotify(ev) => Event::SelectionNotify(SelectionNotify {
            requestor: ev.requestor,
            selection: ev.selection,
            target: ev.target,
            property: ev.property,
            time: Timestamp(ev.time),
        }),
        X11Event::PropertyNotify(ev) => Event::PropertyNotify(PropertyNotify {
            window: ev.window,
            atom: ev.atom,
            state: if ev.state == Property::DELETE {
                PropertyState::Deleted
            } else {
                PropertyState::NewValue
            },
            time: Timestamp(ev.time),
        }),
        X11Event::Expose(ev) => Event::Expose(ExposeEvent {
            window: ev.window,
            area: Rectangle::from_loc_and_size(
                (i32::from(ev.x), i32::from(ev.y)),
                (i32::from(ev.width), i32::from(ev.height)),
            ),
            count: ev.count,
        }),
        _ => return None,
    };
    Some(event)
}

fn matches_property(event: &X11Event, window: Window, property: Atom) -> bool {
    matches!(event, X11Event::PropertyNotify(ev) if ev.window == window && ev.atom == property)
}

impl DisplayConnection for X11Connection {
    fn root(&self) -> Window {
        self.root
    }

    fn intern_atom(&self, name: &str) -> Result<Atom, ConnectionError> {
        Ok(self.conn.intern_atom(false, name.as_bytes())?.reply()?.atom)
    }

    fn atom_name(&self, atom: Atom) -> Result<String, ConnectionError> {
        let reply = self.conn.get_atom_name(atom)?.reply()?;
        Ok(String::from_utf8_lossy(&reply.name).into_owned())
    }

    fn get_property(
        &self,
        window: Window,
        property: Atom,
        type_: Atom,
        long_offset: u32,
        long_length: u32,
    ) -> Result<PropertyReply, ConnectionError> {
        let reply = self
            .conn
            .get_property(false, window, property, type_, long_offset, long_length)?
            .reply()?;
        Ok(PropertyReply {
            type_: reply.type_,
            format: reply.format,
            value: reply.value,
            bytes_after: reply.bytes_after,
        })
    }

    fn change_property(
        &self,
        window: Window,
        property: Atom,
        type_: Atom,
        format: u8,
        data: &[u8],
    ) -> Result<(), ConnectionError> {
        let unit = usize::from(format / 8).max(1);
        if data.len() % unit != 0 {
            return Err(ConnectionError::BadRequest("property data does not match its format"));
        }
        self.conn.change_property(
            PropMode::REPLACE,
            window,
            property,
            type_,
            format,
            (data.len() / unit) as u32,
            data,
        )?;
        Ok(())
    }

    fn delete_property(&self, window: Window, property: Atom) -> Result<(), ConnectionError> {
        self.conn.delete_property(window, property)?;
        Ok(())
    }

    fn send_client_message(&self, destination: Window, message: ClientMessage) -> Result<(), ConnectionError> {
        self.conn.send_event(
            false,
            destination,
            EventMask::NO_EVENT,
            ClientMessageEvent::new(32, message.window, message.type_, message.data),
        )?;
        Ok(())
    }

    fn set_selection_owner(&self, owner: Window, selection: Atom, time: Timestamp) -> Result<(), ConnectionError> {
        self.conn.set_selection_owner(owner, selection, time.0)?;
        Ok(())
    }

    fn selection_owner(&self, selection: Atom) -> Result<Window, ConnectionError> {
        Ok(self.conn.get_selection_owner(selection)?.reply()?.owner)
    }

    fn convert_selection(
        &self,
        requestor: Window,
        selection: Atom,
        target: Atom,
        property: Atom,
        time: Timestamp,
    ) -> Result<(), ConnectionError> {
        self.conn
            .convert_selection(requestor, selection, target, property, time.0)?;
        Ok(())
    }

    fn send_selection_notify(&self, notify: SelectionNotify) -> Result<(), ConnectionError> {
        self.conn.send_event(
            false,
            notify.requestor,
            EventMask::NO_EVENT,
            SelectionNotifyEvent {
                response_type: SELECTION_NOTIFY_EVENT,
                sequence: 0,
                time: notify.time.0,
                requestor: notify.requestor,
                selection: notify.selection,
                target: notify.target,
                property: notify.property,
            },
        )?;
        Ok(())
    }

    fn translate_coordinates(
        &self,
        src: Window,
        dst: Window,
        point: Point,
    ) -> Result<Option<(Point, Window)>, ConnectionError> {
        let reply = self
            .conn
            .translate_coordinates(src, dst, point.x as i16, point.y as i16)?
            .reply()?;
        if !reply.same_screen {
            return Ok(None);
        }
        Ok(Some((
            Point::new(i32::from(reply.dst_x), i32::from(reply.dst_y)),
            reply.child,
        )))
    }

    fn parent(&self, window: Window) -> Result<Option<Window>, ConnectionError> {
        let reply = self.conn.query_tree(window)?.reply()?;
        Ok((reply.parent != NONE).then_some(reply.parent))
    }

    fn select_property_events(&self, window: Window) -> Result<(), ConnectionError> {
        let attributes = self.conn.get_window_attributes(window)?.reply()?;
        if attributes.your_event_mask.contains(EventMask::PROPERTY_CHANGE) {
            return Ok(());
        }
        self.conn.change_window_attributes(
            window,
            &ChangeWindowAttributesAux::new().event_mask(attributes.your_event_mask | EventMask::PROPERTY_CHANGE),
        )?;
        Ok(())
    }

    fn grab_pointer(
        &self,
        window: Window,
        cursor: Option<Cursor>,
        time: Timestamp,
    ) -> Result<bool, ConnectionError> {
        let reply = self
            .conn
            .grab_pointer(
                false,
                window,
                EventMask::BUTTON_MOTION | EventMask::POINTER_MOTION | EventMask::BUTTON_RELEASE,
                GrabMode::ASYNC,
                GrabMode::ASYNC,
                NONE,
                cursor.unwrap_or(NONE),
                time.0,
            )?
            .reply()?;
        trace!(window, status = ?reply.status, "Pointer grab");
        Ok(reply.status == GrabStatus::SUCCESS)
    }

    fn ungrab_pointer(&self, time: Timestamp) -> Result<(), ConnectionError> {
        self.conn.ungrab_pointer(time.0)?;
        Ok(())
    }

    fn change_grab_cursor(&self, cursor: Option<Cursor>, time: Timestamp) -> Result<(), ConnectionError> {
        self.conn.change_active_pointer_grab(
            cursor.unwrap_or(NONE),
            time.0,
            EventMask::BUTTON_MOTION | EventMask::POINTER_MOTION | EventMask::BUTTON_RELEASE,
        )?;
        Ok(())
    }

    fn take_property_notify(
        &self,
        window: Window,
        property: Atom,
    ) -> Result<Option<PropertyNotify>, ConnectionError> {
        let mut backlog = self.backlog.lock().unwrap();
        let found = match backlog
            .iter()
            .position(|event| matches_property(event, window, property))
        {
            Some(idx) => backlog.remove(idx),
            None => loop {
                match self.conn.poll_for_event()? {
                    Some(event) if matches_property(&event, window, property) => break Some(event),
                    Some(event) => backlog.push_back(event),
                    None => break None,
                }
            },
        };

        Ok(found.as_ref().and_then(convert_event).and_then(|event| match event {
            Event::PropertyNotify(notify) => Some(notify),
            _ => None,
        }))
    }

    fn flush(&self) -> Result<(), ConnectionError> {
        self.conn.flush()?;
        Ok(())
    }
}
