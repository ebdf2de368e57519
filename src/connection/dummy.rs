//! In-memory display server for tests
//!
//! [`DummyServer`] keeps a window tree, window properties, selection owners and one event
//! queue per connected client. It implements just enough of the X11 semantics for the XDND
//! engine: property change notifications go to every client that selected them, client
//! messages and selection events go to the client owning the destination window.
//!
//! ```
//! use xdnd::connection::{dummy::DummyServer, DisplayConnection};
//! use xdnd::utils::Rectangle;
//!
//! let server = DummyServer::new(1920, 1080);
//! let client = server.connect();
//! let window = client.create_window(client.root(), Rectangle::from_loc_and_size((10, 10), (100, 100)));
//! assert_eq!(client.parent(window).unwrap(), Some(client.root()));
//! ```

use std::{
    cell::RefCell,
    collections::{HashMap, VecDeque},
    fmt,
    rc::Rc,
};

use indexmap::IndexMap;
use tracing::trace;

use super::{
    predefined, Atom, ClientMessage, ConnectionError, Cursor, DisplayConnection, Event, PropertyNotify,
    PropertyReply, PropertyState, SelectionNotify, SelectionRequest, Window, NONE,
};
use crate::utils::{Point, Rectangle, Timestamp};

/// Identifier of a client of a [`DummyServer`]
pub type ClientId = usize;

const ROOT_WINDOW: Window = 1;
const SERVER_CLIENT: ClientId = 0;
const FIRST_CUSTOM_ATOM: Atom = 69;

#[derive(Debug)]
struct StoredProperty {
    type_: Atom,
    format: u8,
    data: Vec<u8>,
}

#[derive(Debug)]
struct WindowData {
    parent: Option<Window>,
    geometry: Rectangle,
    children: Vec<Window>,
    client: ClientId,
    properties: HashMap<Atom, StoredProperty>,
    listeners: Vec<ClientId>,
}

#[derive(Debug)]
struct IncrFeed {
    type_: Atom,
    chunks: VecDeque<Vec<u8>>,
}

#[derive(Debug, Default)]
struct ServerState {
    atoms: IndexMap<String, Atom>,
    next_atom: Atom,
    next_window: Window,
    windows: HashMap<Window, WindowData>,
    selections: HashMap<Atom, Window>,
    queues: Vec<VecDeque<Event>>,
    time: u32,
    grab: Option<(ClientId, Option<Cursor>)>,
    refuse_grabs: bool,
    incr_feeds: HashMap<(Window, Atom), IncrFeed>,
    sent_messages: Vec<(Window, ClientMessage)>,
}

impl ServerState {
    fn window(&self, window: Window) -> Result<&WindowData, ConnectionError> {
        self.windows.get(&window).ok_or(ConnectionError::BadWindow(window))
    }

    fn window_mut(&mut self, window: Window) -> Result<&mut WindowData, ConnectionError> {
        self.windows
            .get_mut(&window)
            .ok_or(ConnectionError::BadWindow(window))
    }

    fn origin(&self, window: Window) -> Result<Point, ConnectionError> {
        let mut origin = Point::new(0, 0);
        let mut current = Some(window);
        while let Some(window) = current {
            let data = self.window(window)?;
            origin.x += data.geometry.loc.x;
            origin.y += data.geometry.loc.y;
            current = data.parent;
        }
        Ok(origin)
    }

    fn push_event(&mut self, client: ClientId, event: Event) {
        if let Some(queue) = self.queues.get_mut(client) {
            queue.push_back(event);
        }
    }

    fn notify_property(&mut self, window: Window, atom: Atom, state: PropertyState) {
        let Some(data) = self.windows.get(&window) else {
            return;
        };
        let event = Event::PropertyNotify(PropertyNotify {
            window,
            atom,
            state,
            time: Timestamp(self.time),
        });
        for client in data.listeners.clone() {
            self.push_event(client, event);
        }
    }

    fn set_property(&mut self, window: Window, atom: Atom, type_: Atom, format: u8, data: Vec<u8>) {
        if let Some(window_data) = self.windows.get_mut(&window) {
            window_data
                .properties
                .insert(atom, StoredProperty { type_, format, data });
            self.notify_property(window, atom, PropertyState::NewValue);
        }
    }
}

/// An in-memory display server
#[derive(Clone)]
pub struct DummyServer {
    state: Rc<RefCell<ServerState>>,
}

impl fmt::Debug for DummyServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DummyServer").finish_non_exhaustive()
    }
}

impl DummyServer {
    /// Create a new server with a root window of the given size
    pub fn new(width: i32, height: i32) -> Self {
        let mut state = ServerState {
            next_atom: FIRST_CUSTOM_ATOM,
            next_window: ROOT_WINDOW + 1,
            time: 1,
            ..Default::default()
        };
        for (name, atom) in predefined::NAMES {
            state.atoms.insert(name.to_string(), *atom);
        }
        state.windows.insert(
            ROOT_WINDOW,
            WindowData {
                parent: None,
                geometry: Rectangle::from_loc_and_size((0, 0), (width, height)),
                children: Vec::new(),
                client: SERVER_CLIENT,
                properties: HashMap::new(),
                listeners: Vec::new(),
            },
        );
        state.queues.push(VecDeque::new());

        DummyServer {
            state: Rc::new(RefCell::new(state)),
        }
    }

    /// Connect a new client
    pub fn connect(&self) -> DummyConnection {
        let mut state = self.state.borrow_mut();
        state.queues.push(VecDeque::new());
        DummyConnection {
            server: self.clone(),
            client: state.queues.len() - 1,
        }
    }

    /// Current server time
    pub fn time(&self) -> Timestamp {
        Timestamp(self.state.borrow().time)
    }

    /// Advance the server clock by `millis` and return the new time
    pub fn advance_time(&self, millis: u32) -> Timestamp {
        let mut state = self.state.borrow_mut();
        state.time = state.time.wrapping_add(millis);
        Timestamp(state.time)
    }

    /// Make every following pointer grab fail
    pub fn refuse_grabs(&self, refuse: bool) {
        self.state.borrow_mut().refuse_grabs = refuse;
    }

    /// The client currently holding the pointer grab, and its cursor
    pub fn grab(&self) -> Option<(ClientId, Option<Cursor>)> {
        self.state.borrow().grab
    }

    /// Simulate a foreign selection owner streaming `chunks` into `property` on `window`
    ///
    /// Every time the property gets deleted, the next chunk is stored, the way an INCR
    /// sender reacts to the requestor deleting the property.
    pub fn feed_incr(&self, window: Window, property: Atom, type_: Atom, chunks: Vec<Vec<u8>>) {
        self.state.borrow_mut().incr_feeds.insert(
            (window, property),
            IncrFeed {
                type_,
                chunks: chunks.into(),
            },
        );
    }

    /// All client messages sent so far, with their destination
    pub fn sent_messages(&self) -> Vec<(Window, ClientMessage)> {
        self.state.borrow().sent_messages.clone()
    }

    /// Read a property without any side effects, as `(type, format, data)`
    pub fn property(&self, window: Window, property: Atom) -> Option<(Atom, u8, Vec<u8>)> {
        let state = self.state.borrow();
        let prop = state.windows.get(&window)?.properties.get(&property)?;
        Some((prop.type_, prop.format, prop.data.clone()))
    }
}

/// A client connection to a [`DummyServer`]
#[derive(Debug, Clone)]
pub struct DummyConnection {
    server: DummyServer,
    client: ClientId,
}

impl DummyConnection {
    /// The server this client is connected to
    pub fn server(&self) -> &DummyServer {
        &self.server
    }

    /// The id of this client
    pub fn client_id(&self) -> ClientId {
        self.client
    }

    /// Create a window owned by this client, on top of its siblings
    ///
    /// `geometry` is relative to the parent.
    ///
    /// # Panics
    ///
    /// Panics if `parent` does not exist.
    pub fn create_window(&self, parent: Window, geometry: Rectangle) -> Window {
        let mut state = self.server.state.borrow_mut();
        let window = state.next_window;
        state.next_window += 1;
        state
            .windows
            .get_mut(&parent)
            .expect("parent window does not exist")
            .children
            .push(window);
        state.windows.insert(
            window,
            WindowData {
                parent: Some(parent),
                geometry,
                children: Vec::new(),
                client: self.client,
                properties: HashMap::new(),
                listeners: Vec::new(),
            },
        );
        window
    }

    /// Take the next queued event of this client
    pub fn next_event(&self) -> Option<Event> {
        self.server.state.borrow_mut().queues[self.client].pop_front()
    }

    /// Number of queued events of this client
    pub fn pending_events(&self) -> usize {
        self.server.state.borrow().queues[self.client].len()
    }
}

impl DisplayConnection for DummyConnection {
    fn root(&self) -> Window {
        ROOT_WINDOW
    }

    fn intern_atom(&self, name: &str) -> Result<Atom, ConnectionError> {
        let mut state = self.server.state.borrow_mut();
        if let Some(atom) = state.atoms.get(name) {
            return Ok(*atom);
        }
        let atom = state.next_atom;
        state.next_atom += 1;
        state.atoms.insert(name.to_string(), atom);
        Ok(atom)
    }

    fn atom_name(&self, atom: Atom) -> Result<String, ConnectionError> {
        self.server
            .state
            .borrow()
            .atoms
            .iter()
            .find(|(_, value)| **value == atom)
            .map(|(name, _)| name.clone())
            .ok_or(ConnectionError::BadAtom(atom))
    }

    fn get_property(
        &self,
        window: Window,
        property: Atom,
        type_: Atom,
        long_offset: u32,
        long_length: u32,
    ) -> Result<PropertyReply, ConnectionError> {
        let state = self.server.state.borrow();
        let Some(prop) = state.window(window)?.properties.get(&property) else {
            return Ok(PropertyReply::default());
        };

        if type_ != predefined::ANY && type_ != prop.type_ {
            return Ok(PropertyReply {
                type_: prop.type_,
                format: prop.format,
                value: Vec::new(),
                bytes_after: prop.data.len() as u32,
            });
        }

        let offset = (long_offset as usize).saturating_mul(4);
        if offset > prop.data.len() {
            return Err(ConnectionError::BadRequest("property offset out of range"));
        }
        let available = prop.data.len() - offset;
        let take = available.min((long_length as usize).saturating_mul(4));
        Ok(PropertyReply {
            type_: prop.type_,
            format: prop.format,
            value: prop.data[offset..offset + take].to_vec(),
            bytes_after: (available - take) as u32,
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
        let mut state = self.server.state.borrow_mut();
        state.window(window)?;
        state.set_property(window, property, type_, format, data.to_vec());
        Ok(())
    }

    fn delete_property(&self, window: Window, property: Atom) -> Result<(), ConnectionError> {
        let mut state = self.server.state.borrow_mut();
        if state.window_mut(window)?.properties.remove(&property).is_none() {
            return Ok(());
        }
        state.notify_property(window, property, PropertyState::Deleted);

        let next = state.incr_feeds.get_mut(&(window, property)).and_then(|feed| {
            let chunk = feed.chunks.pop_front()?;
            Some((feed.type_, chunk))
        });
        if let Some((type_, chunk)) = next {
            trace!(window, len = chunk.len(), "Feeding next incremental chunk");
            state.set_property(window, property, type_, 8, chunk);
        }
        Ok(())
    }

    fn send_client_message(&self, destination: Window, message: ClientMessage) -> Result<(), ConnectionError> {
        let mut state = self.server.state.borrow_mut();
        let client = state.window(destination)?.client;
        state.sent_messages.push((destination, message));
        state.push_event(client, Event::ClientMessage(message));
        Ok(())
    }

    fn set_selection_owner(&self, owner: Window, selection: Atom, _time: Timestamp) -> Result<(), ConnectionError> {
        let mut state = self.server.state.borrow_mut();
        if owner == NONE {
            state.selections.remove(&selection);
        } else {
            state.window(owner)?;
            state.selections.insert(selection, owner);
        }
        Ok(())
    }

    fn selection_owner(&self, selection: Atom) -> Result<Window, ConnectionError> {
        Ok(self
            .server
            .state
            .borrow()
            .selections
            .get(&selection)
            .copied()
            .unwrap_or(NONE))
    }

    fn convert_selection(
        &self,
        requestor: Window,
        selection: Atom,
        target: Atom,
        property: Atom,
        time: Timestamp,
    ) -> Result<(), ConnectionError> {
        let mut state = self.server.state.borrow_mut();
        let requestor_client = state.window(requestor)?.client;
        match state.selections.get(&selection).copied() {
            Some(owner) => {
                let owner_client = state.window(owner)?.client;
                state.push_event(
                    owner_client,
                    Event::SelectionRequest(SelectionRequest {
                        owner,
                        requestor,
                        selection,
                        target,
                        property,
                        time,
                    }),
                );
            }
            None => state.push_event(
                requestor_client,
                Event::SelectionNotify(SelectionNotify {
                    requestor,
                    selection,
                    target,
                    property: NONE,
                    time,
                }),
            ),
        }
        Ok(())
    }

    fn send_selection_notify(&self, notify: SelectionNotify) -> Result<(), ConnectionError> {
        let mut state = self.server.state.borrow_mut();
        let client = state.window(notify.requestor)?.client;
        state.push_event(client, Event::SelectionNotify(notify));
        Ok(())
    }

    fn translate_coordinates(
        &self,
        src: Window,
        dst: Window,
        point: Point,
    ) -> Result<Option<(Point, Window)>, ConnectionError> {
        let state = self.server.state.borrow();
        let src_origin = state.origin(src)?;
        let dst_origin = state.origin(dst)?;
        let local = Point::new(
            point.x + src_origin.x - dst_origin.x,
            point.y + src_origin.y - dst_origin.y,
        );

        let child = state
            .window(dst)?
            .children
            .iter()
            .rev()
            .copied()
            .find(|child| {
                state
                    .windows
                    .get(child)
                    .is_some_and(|data| data.geometry.contains(local))
            })
            .unwrap_or(NONE);
        Ok(Some((local, child)))
    }

    fn parent(&self, window: Window) -> Result<Option<Window>, ConnectionError> {
        Ok(self.server.state.borrow().window(window)?.parent)
    }

    fn select_property_events(&self, window: Window) -> Result<(), ConnectionError> {
        let client = self.client;
        let mut state = self.server.state.borrow_mut();
        let data = state.window_mut(window)?;
        if !data.listeners.contains(&client) {
            data.listeners.push(client);
        }
        Ok(())
    }

    fn grab_pointer(
        &self,
        window: Window,
        cursor: Option<Cursor>,
        _time: Timestamp,
    ) -> Result<bool, ConnectionError> {
        let mut state = self.server.state.borrow_mut();
        state.window(window)?;
        if state.refuse_grabs || state.grab.is_some_and(|(client, _)| client != self.client) {
            return Ok(false);
        }
        state.grab = Some((self.client, cursor));
        Ok(true)
    }

    fn ungrab_pointer(&self, _time: Timestamp) -> Result<(), ConnectionError> {
        let mut state = self.server.state.borrow_mut();
        if state.grab.is_some_and(|(client, _)| client == self.client) {
            state.grab = None;
        }
        Ok(())
    }

    fn change_grab_cursor(&self, cursor: Option<Cursor>, _time: Timestamp) -> Result<(), ConnectionError> {
        let mut state = self.server.state.borrow_mut();
        if let Some((client, current)) = state.grab.as_mut() {
            if *client == self.client {
                *current = cursor;
            }
        }
        Ok(())
    }

    fn take_property_notify(
        &self,
        window: Window,
        property: Atom,
    ) -> Result<Option<PropertyNotify>, ConnectionError> {
        let mut state = self.server.state.borrow_mut();
        let queue = &mut state.queues[self.client];
        let position = queue.iter().position(|event| {
            matches!(event, Event::PropertyNotify(notify) if notify.window == window && notify.atom == property)
        });
        Ok(position
            .and_then(|idx| queue.remove(idx))
            .and_then(|event| match event {
                Event::PropertyNotify(notify) => Some(notify),
                _ => None,
            }))
    }

    fn flush(&self) -> Result<(), ConnectionError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn translate_finds_topmost_child() {
        let server = DummyServer::new(800, 600);
        let conn = server.connect();
        let lower = conn.create_window(ROOT_WINDOW, Rectangle::from_loc_and_size((0, 0), (400, 400)));
        let upper = conn.create_window(ROOT_WINDOW, Rectangle::from_loc_and_size((100, 100), (400, 400)));
        let nested = conn.create_window(upper, Rectangle::from_loc_and_size((10, 10), (50, 50)));

        let (_, child) = conn
            .translate_coordinates(ROOT_WINDOW, ROOT_WINDOW, Point::new(150, 150))
            .unwrap()
            .unwrap();
        assert_eq!(child, upper);

        let (_, child) = conn
            .translate_coordinates(ROOT_WINDOW, ROOT_WINDOW, Point::new(50, 50))
            .unwrap()
            .unwrap();
        assert_eq!(child, lower);

        let (local, child) = conn
            .translate_coordinates(ROOT_WINDOW, upper, Point::new(115, 115))
            .unwrap()
            .unwrap();
        assert_eq!(local, Point::new(15, 15));
        assert_eq!(child, nested);
    }

    #[test]
    fn property_notifications_reach_listeners_only() {
        let server = DummyServer::new(800, 600);
        let owner = server.connect();
        let listener = server.connect();
        let window = owner.create_window(ROOT_WINDOW, Rectangle::from_loc_and_size((0, 0), (10, 10)));
        let atom = owner.intern_atom("FOO").unwrap();

        listener.select_property_events(window).unwrap();
        owner.change_property8(window, atom, predefined::STRING, b"bar").unwrap();
        owner.delete_property(window, atom).unwrap();

        assert_eq!(owner.pending_events(), 0);
        assert!(matches!(
            listener.next_event(),
            Some(Event::PropertyNotify(PropertyNotify { state: PropertyState::NewValue, .. }))
        ));
        assert!(matches!(
            listener.next_event(),
            Some(Event::PropertyNotify(PropertyNotify { state: PropertyState::Deleted, .. }))
        ));
    }

    #[test]
    fn convert_without_owner_fails() {
        let server = DummyServer::new(800, 600);
        let conn = server.connect();
        let window = conn.create_window(ROOT_WINDOW, Rectangle::from_loc_and_size((0, 0), (10, 10)));
        let selection = conn.intern_atom("XdndSelection").unwrap();
        conn.convert_selection(window, selection, predefined::STRING, selection, Timestamp(5))
            .unwrap();
        assert!(matches!(
            conn.next_event(),
            Some(Event::SelectionNotify(SelectionNotify { property: NONE, .. }))
        ));
    }

    #[test]
    fn get_property_ranges() {
        let server = DummyServer::new(800, 600);
        let conn = server.connect();
        let window = conn.create_window(ROOT_WINDOW, Rectangle::from_loc_and_size((0, 0), (10, 10)));
        let atom = conn.intern_atom("DATA").unwrap();
        conn.change_property8(window, atom, predefined::STRING, b"0123456789").unwrap();

        let peek = conn.get_property(window, atom, predefined::ANY, 0, 0).unwrap();
        assert_eq!(peek.type_, predefined::STRING);
        assert!(peek.value.is_empty());
        assert_eq!(peek.bytes_after, 10);

        let part = conn.get_property(window, atom, predefined::ANY, 1, 1).unwrap();
        assert_eq!(part.value, b"4567");
        assert_eq!(part.bytes_after, 2);

        let missing = conn.get_property(window, 4242, predefined::ANY, 0, 1).unwrap();
        assert!(missing.is_none());
    }

    #[test]
    fn unknown_resources_are_errors() {
        let server = DummyServer::new(800, 600);
        let conn = server.connect();
        assert!(matches!(
            conn.get_property(4242, predefined::STRING, predefined::ANY, 0, 1),
            Err(ConnectionError::BadWindow(4242))
        ));
        assert!(matches!(conn.atom_name(99_999), Err(ConnectionError::BadAtom(99_999))));
    }
}
