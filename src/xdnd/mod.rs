//! XDND drag'n'drop protocol engine
//!
//! This module implements both sides of the [XDND protocol](https://www.freedesktop.org/wiki/Specifications/XDND/):
//!
//! - [`DragController`] runs on the drag source. It follows the pointer, finds XDND aware
//!   windows, exchanges `XdndEnter`/`XdndPosition`/`XdndStatus`/`XdndLeave` with them and
//!   finally drops and waits for `XdndFinished`.
//! - [`DropController`] runs on the drop target. It answers positions through the host's
//!   [`DndHandler`], converts the `XdndSelection` on drop and hands the payload to the host.
//!
//! Both controllers are plain state objects. The host feeds them [`Event`](crate::connection::Event)s
//! from its own event loop through their `handle_event` methods and gets an outcome back once
//! a session ends:
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use xdnd::connection::{Atom, Window, dummy::DummyServer};
//! # use xdnd::xdnd::*;
//! # struct App;
//! # impl DndHandler for App {
//! #     fn window_belongs_to_us(&self, _: Window) -> bool { true }
//! #     fn apply_leave_visual(&mut self, _: Window) {}
//! #     fn apply_position(&mut self, _: PositionRequest<'_>) -> PositionReply { PositionReply::reject() }
//! #     fn get_payload(&mut self, _: Window, _: Atom) -> Option<Vec<u8>> { None }
//! #     fn insert_payload(&mut self, _: &[u8], _: usize, _: Window, _: Window, _: Atom) -> bool { false }
//! # }
//! # let server = DummyServer::new(100, 100);
//! # let conn = Arc::new(server.connect());
//! # let mut app = App;
//! let ctx = ProtocolContext::new(conn.clone(), DndConfig::default()).unwrap();
//! let mut drop = DropController::new();
//! while let Some(event) = conn.next_event() {
//!     if let Some(outcome) = drop.handle_event(&ctx, &mut app, &event) {
//!         println!("drop finished: {:?}", outcome);
//!     }
//! }
//! ```

use std::{sync::Arc, time::Duration};

use crate::{
    connection::{Atom, ConnectionError, Cursor, DisplayConnection, ExposeEvent, Window},
    utils::{Point, Rectangle, Timestamp},
};

pub mod aware;
mod drag;
mod drop;
pub mod list;
pub mod message;
pub mod transfer;

#[cfg(all(test, feature = "backend_dummy"))]
mod testing;

pub use self::drag::{DragController, DragError, DragOffer, DragOutcome, DragSession, DragStage, DropTarget};
pub use self::drop::{DropController, DropOutcome, DropSession, DropStage};
pub use self::list::{negotiate_action, negotiate_type, ActionList, TypeList};

/// XDND version implemented by this crate
pub const XDND_VERSION: u32 = 5;
/// Lowest version accepted under [`VersionPolicy::Strict`]
pub const STRICT_MIN_VERSION: u32 = 3;

macro_rules! atom_table {
    ($(#[$meta:meta])* $name:ident { $($field:ident),* $(,)? }) => {
        $(#[$meta])*
        #[allow(non_snake_case, missing_docs)]
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub struct $name {
            $(pub $field: Atom,)*
        }

        impl $name {
            /// Intern every atom of the table
            pub fn intern<C: DisplayConnection + ?Sized>(conn: &C) -> Result<Self, ConnectionError> {
                Ok($name {
                    $($field: conn.intern_atom(stringify!($field))?,)*
                })
            }
        }
    };
}

atom_table! {
    /// Atoms used by the XDND protocol
    Atoms {
        XdndAware,
        XdndSelection,
        XdndProxy,

        XdndEnter,
        XdndPosition,
        XdndStatus,
        XdndLeave,
        XdndDrop,
        XdndFinished,

        XdndTypeList,
        XdndActionList,
        XdndActionDescription,

        XdndActionCopy,
        XdndActionMove,
        XdndActionLink,
        XdndActionAsk,
        XdndActionPrivate,

        INCR,
    }
}

/// Enumeration of the actions of a Drag'n'Drop operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DndAction {
    /// Data will be copied
    Copy,
    /// Data will be moved
    Move,
    /// A link to the data will be created
    Link,
    /// User will be asked how to handle the data
    Ask,
    /// Private action negotiated out of band
    Private,
}

impl DndAction {
    /// Every action, in wire preference order
    pub const ALL: [DndAction; 5] = [
        DndAction::Copy,
        DndAction::Move,
        DndAction::Link,
        DndAction::Ask,
        DndAction::Private,
    ];

    /// Map an action atom, `None` for unknown atoms
    pub fn from_atom(atom: Atom, atoms: &Atoms) -> Option<DndAction> {
        match atom {
            x if x == atoms.XdndActionCopy => Some(DndAction::Copy),
            x if x == atoms.XdndActionMove => Some(DndAction::Move),
            x if x == atoms.XdndActionLink => Some(DndAction::Link),
            x if x == atoms.XdndActionAsk => Some(DndAction::Ask),
            x if x == atoms.XdndActionPrivate => Some(DndAction::Private),
            _ => None,
        }
    }

    /// The atom representing this action
    pub fn to_atom(self, atoms: &Atoms) -> Atom {
        match self {
            DndAction::Copy => atoms.XdndActionCopy,
            DndAction::Move => atoms.XdndActionMove,
            DndAction::Link => atoms.XdndActionLink,
            DndAction::Ask => atoms.XdndActionAsk,
            DndAction::Private => atoms.XdndActionPrivate,
        }
    }

    fn index(self) -> usize {
        match self {
            DndAction::Copy => 0,
            DndAction::Move => 1,
            DndAction::Link => 2,
            DndAction::Ask => 3,
            DndAction::Private => 4,
        }
    }
}

/// Cursor shown for each action while dragging
///
/// Cursor resources are created by the host, the engine only switches between them on the
/// pointer grab.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CursorTable {
    actions: [Option<Cursor>; 5],
    no_drop: Option<Cursor>,
}

impl CursorTable {
    /// An empty table, leaving the grab cursor untouched
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the cursor used while `action` is accepted
    pub fn with_action(mut self, action: DndAction, cursor: Cursor) -> Self {
        self.actions[action.index()] = Some(cursor);
        self
    }

    /// Set the cursor used while no target accepts the drop
    pub fn with_no_drop(mut self, cursor: Cursor) -> Self {
        self.no_drop = Some(cursor);
        self
    }

    /// Cursor for the accepted action, or the "no drop" cursor for `None`
    pub fn cursor(&self, action: Option<DndAction>) -> Option<Cursor> {
        match action {
            Some(action) => self.actions[action.index()],
            None => self.no_drop,
        }
    }
}

/// Which peers are accepted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VersionPolicy {
    /// Any protocol version is accepted
    #[default]
    Lenient,
    /// Peers below version 3 are treated as not XDND aware
    Strict,
}

impl VersionPolicy {
    /// Whether a peer speaking `version` is acceptable
    pub fn accepts(self, version: u32) -> bool {
        match self {
            VersionPolicy::Lenient => true,
            VersionPolicy::Strict => version >= STRICT_MIN_VERSION,
        }
    }
}

/// Configuration of the XDND engine
#[derive(Debug, Clone, PartialEq)]
pub struct DndConfig {
    /// Protocol version announced by this client
    pub version: u32,
    /// Version requirements for peers
    pub version_policy: VersionPolicy,
    /// Distance in pixels the pointer has to travel before a press turns into a drag
    pub drag_threshold: f64,
    /// How long the source waits for `XdndFinished` after dropping
    pub finished_timeout: Duration,
    /// How long a selection transfer may stay silent before it is aborted
    pub transfer_timeout: Duration,
    /// Sleep between polls of [`transfer::fetch_payload`]
    pub poll_interval: Duration,
    /// Maximum amount of 32-bit units read from a property at once
    pub max_property_length: u32,
    /// Payloads above this size are sent incrementally
    pub incr_chunk_size: usize,
    /// Treat every window as a drop target, XDND aware or not
    pub no_hysteresis: bool,
    /// Collect incoming payloads and hand them to the host in one piece
    ///
    /// If disabled, [`DndHandler::insert_payload`] is called once per received chunk.
    pub buffer_incoming: bool,
    /// Actions our drop targets can perform
    ///
    /// An empty list only allows [`DndAction::Copy`].
    pub supported_actions: Vec<DndAction>,
}

impl Default for DndConfig {
    fn default() -> Self {
        DndConfig {
            version: XDND_VERSION,
            version_policy: VersionPolicy::Lenient,
            drag_threshold: 4.0,
            finished_timeout: Duration::from_secs(10),
            transfer_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(10),
            max_property_length: 0x1fff_ffff,
            incr_chunk_size: 64 * 1024,
            no_hysteresis: false,
            buffer_incoming: true,
            supported_actions: DndAction::ALL.to_vec(),
        }
    }
}

/// Connection wide state of the XDND engine
///
/// Created once per display connection and borrowed by the [`DragController`] and
/// [`DropController`] on every call.
#[derive(Debug)]
pub struct ProtocolContext<C> {
    conn: Arc<C>,
    atoms: Atoms,
    payload: Atom,
    config: DndConfig,
    cursors: CursorTable,
}

impl<C: DisplayConnection> ProtocolContext<C> {
    /// Intern the protocol atoms and create the context
    pub fn new(conn: Arc<C>, config: DndConfig) -> Result<Self, ConnectionError> {
        let atoms = Atoms::intern(&*conn)?;
        // private property, so foreign selection traffic is never taken for a drop
        let payload = conn.intern_atom(&format!("_XDND_PAYLOAD_{}", std::process::id()))?;
        tracing::debug!(version = config.version, ?config.version_policy, "XDND context initialized");
        Ok(ProtocolContext {
            conn,
            atoms,
            payload,
            config,
            cursors: CursorTable::default(),
        })
    }

    /// Replace the cursor table
    pub fn with_cursors(mut self, cursors: CursorTable) -> Self {
        self.cursors = cursors;
        self
    }

    /// The display connection
    pub fn connection(&self) -> &C {
        &self.conn
    }

    /// The interned protocol atoms
    pub fn atoms(&self) -> &Atoms {
        &self.atoms
    }

    /// Property drop payloads are converted into
    pub fn payload_property(&self) -> Atom {
        self.payload
    }

    /// The engine configuration
    pub fn config(&self) -> &DndConfig {
        &self.config
    }

    /// The cursor table
    pub fn cursors(&self) -> &CursorTable {
        &self.cursors
    }

    /// The locally supported protocol version
    pub fn version(&self) -> u32 {
        self.config.version
    }

    /// Version to speak with a peer announcing `peer`, or `None` if the peer is not acceptable
    pub fn negotiate_version(&self, peer: u32) -> Option<u32> {
        self.config
            .version_policy
            .accepts(peer)
            .then(|| peer.min(self.config.version))
    }
}

/// A position update handed to [`DndHandler::apply_position`]
#[derive(Debug, Clone, Copy)]
pub struct PositionRequest<'a> {
    /// The window under the pointer, resolved down to the deepest subwindow
    pub window: Window,
    /// The drag source
    pub source: Window,
    /// Action proposed by the source
    pub action: DndAction,
    /// Pointer location in root coordinates
    pub point: Point,
    /// Timestamp of the position
    pub time: Timestamp,
    /// Types offered by the source
    pub types: &'a TypeList,
}

/// Answer of [`DndHandler::apply_position`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PositionReply {
    /// Whether a drop at this position would be accepted
    pub accept: bool,
    /// Whether further positions inside `rect` should be sent
    pub want_position: bool,
    /// The action that would be performed
    pub action: Option<DndAction>,
    /// The type that would be requested, `None` for the source's first type
    pub desired_type: Option<Atom>,
    /// Root relative area in which the reply stays valid
    pub rect: Rectangle,
}

impl PositionReply {
    /// Reject the drop, asking for further positions
    pub fn reject() -> Self {
        PositionReply {
            accept: false,
            want_position: true,
            action: None,
            desired_type: None,
            rect: Rectangle::default(),
        }
    }

    /// Accept the drop with the given action and type, asking for further positions
    pub fn accept(action: DndAction, desired_type: Option<Atom>) -> Self {
        PositionReply {
            accept: true,
            want_position: true,
            action: Some(action),
            desired_type,
            rect: Rectangle::default(),
        }
    }

    /// The action and type a drop would use
    ///
    /// `None` if the reply rejects, asks for a type the source does not offer, or picks an
    /// action outside of `supported`. The source's `proposed` action is used if the reply
    /// names none.
    pub fn negotiate(&self, proposed: DndAction, offered: &[Atom], supported: &[DndAction]) -> Option<(DndAction, Atom)> {
        if !self.accept {
            return None;
        }
        let type_ = negotiate_type(self.desired_type.as_slice(), offered)?;
        let action = negotiate_action(self.action.unwrap_or(proposed), supported)?;
        Some((action, type_))
    }
}

/// Host side of the XDND engine
///
/// The engine calls these to find out about the host's windows and to hand over data.
pub trait DndHandler {
    /// Whether `window` is one of the host's own windows
    fn window_belongs_to_us(&self, window: Window) -> bool;

    /// Remove any drop highlighting from `window`
    fn apply_leave_visual(&mut self, window: Window);

    /// The pointer moved over `request.window` during a drag
    fn apply_position(&mut self, request: PositionRequest<'_>) -> PositionReply;

    /// Produce the data of the current drag from `window` as `type_`
    fn get_payload(&mut self, window: Window, type_: Atom) -> Option<Vec<u8>>;

    /// Insert dropped data into `into`
    ///
    /// `remaining` is the amount of data known to follow `data`. Whole buffers report `0`,
    /// as do chunks of incremental transfers whose total size is unknown.
    /// Returns whether the data was accepted.
    fn insert_payload(&mut self, data: &[u8], remaining: usize, into: Window, from: Window, type_: Atom) -> bool;

    /// A window needs to be redrawn while the source waits for the drop to finish
    fn handle_expose(&mut self, event: &ExposeEvent) {
        let _ = event;
    }

    /// Pick one of the actions offered for an `ask` drop
    ///
    /// Defaults to the first offered action. `None` aborts the drop.
    fn choose_action(&mut self, descriptions: &[String], actions: &[DndAction]) -> Option<DndAction> {
        let _ = descriptions;
        actions.first().copied()
    }
}
