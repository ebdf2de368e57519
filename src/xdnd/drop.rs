use std::time::Instant;

use tracing::{debug, trace, warn};

use super::{
    aware::descend,
    list::{negotiate_action, ActionList, TypeList},
    message::XdndMessage,
    transfer::{request_time, IncomingTransfer, TransferBuffer, TransferError, TransferStart, TransferStep},
    DndAction, DndHandler, PositionRequest, ProtocolContext,
};
use crate::{
    connection::{Atom, ConnectionError, DisplayConnection, Event, PropertyNotify, SelectionNotify, Window, NONE},
    utils::{Point, Timestamp},
};

/// Stage of a [`DropSession`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropStage {
    /// No drag is over any of our windows
    Idle,
    /// A drag source entered one of our toplevels
    Entered,
    /// The data of a drop is being transferred
    Converting,
}

/// How a drop session ended
#[derive(Debug)]
pub enum DropOutcome {
    /// The source left without dropping
    Left {
        /// The drag source
        source: Window,
    },
    /// The drop was refused
    Rejected {
        /// The drag source
        source: Window,
    },
    /// The data was inserted
    Completed {
        /// The drag source
        source: Window,
        /// The window the data was inserted into
        window: Window,
        /// Type of the data
        type_: Atom,
        /// The performed action
        action: DndAction,
        /// Number of bytes received
        len: usize,
    },
    /// The drop was accepted, but transferring the data failed
    Failed {
        /// The drag source
        source: Window,
        /// What went wrong
        reason: TransferError,
    },
}

#[derive(Debug)]
struct Conversion {
    type_: Atom,
    requested: Instant,
    transfer: Option<IncomingTransfer>,
    buffer: TransferBuffer,
}

/// State of a drag hovering over one of our toplevels
#[derive(Debug)]
pub struct DropSession {
    source: Window,
    toplevel: Window,
    subwindow: Window,
    version: u32,
    types: TypeList,
    desired_type: Option<Atom>,
    will_accept: bool,
    action: Option<DndAction>,
    position_seen: bool,
    last_time: Timestamp,
    conversion: Option<Conversion>,
}

impl DropSession {
    /// Current stage
    pub fn stage(&self) -> DropStage {
        if self.conversion.is_some() {
            DropStage::Converting
        } else {
            DropStage::Entered
        }
    }

    /// The drag source
    pub fn source(&self) -> Window {
        self.source
    }

    /// The toplevel the source is talking to
    pub fn toplevel(&self) -> Window {
        self.toplevel
    }

    /// The deepest window under the pointer
    pub fn subwindow(&self) -> Window {
        self.subwindow
    }

    /// Negotiated protocol version
    pub fn version(&self) -> u32 {
        self.version
    }

    /// Types offered by the source
    pub fn types(&self) -> &TypeList {
        &self.types
    }

    /// Whether the last position was accepted
    pub fn will_accept(&self) -> bool {
        self.will_accept
    }

    /// The type that will be requested on drop
    pub fn desired_type(&self) -> Option<Atom> {
        self.desired_type
    }

    /// The action that will be performed on drop
    pub fn action(&self) -> Option<DndAction> {
        self.action
    }

    /// Timestamp of the last position or drop
    pub fn last_time(&self) -> Timestamp {
        self.last_time
    }
}

/// The drop target side of XDND
///
/// Feed every event of the host's toplevels to [`DropController::handle_event`]. Foreign
/// events are left alone, so the controller can see the complete event stream.
#[derive(Debug, Default)]
pub struct DropController {
    session: Option<DropSession>,
}

impl DropController {
    /// A controller without session
    pub fn new() -> Self {
        Self::default()
    }

    /// The active session, if any
    pub fn session(&self) -> Option<&DropSession> {
        self.session.as_ref()
    }

    /// Current stage
    pub fn stage(&self) -> DropStage {
        self.session.as_ref().map_or(DropStage::Idle, DropSession::stage)
    }

    /// Process an event
    ///
    /// Returns `Some` once a session ended, the controller is idle afterwards.
    pub fn handle_event<C, H>(&mut self, ctx: &ProtocolContext<C>, handler: &mut H, event: &Event) -> Option<DropOutcome>
    where
        C: DisplayConnection,
        H: DndHandler + ?Sized,
    {
        let now = Instant::now();
        let outcome = match event {
            Event::ClientMessage(message) => match XdndMessage::decode(message, ctx.atoms()) {
                Some(decoded) => self.handle_message(ctx, handler, message.window, decoded, now),
                None => None,
            },
            Event::SelectionNotify(notify) => self.handle_selection_notify(ctx, handler, notify, now),
            Event::PropertyNotify(notify) => self.handle_property_notify(ctx, handler, notify, now),
            _ => None,
        };
        outcome.or_else(|| self.dispatch_timeouts(ctx, handler, now))
    }

    /// Abort a transfer that stalled
    ///
    /// Covers both the wait for the selection owner to answer and the silence between two
    /// chunks of an incremental transfer. [`DropController::handle_event`] calls this on every
    /// event, hosts with timers may call it on their own.
    pub fn dispatch_timeouts<C, H>(
        &mut self,
        ctx: &ProtocolContext<C>,
        handler: &mut H,
        now: Instant,
    ) -> Option<DropOutcome>
    where
        C: DisplayConnection,
        H: DndHandler + ?Sized,
    {
        let conversion = self.session.as_ref()?.conversion.as_ref()?;
        let expired = match &conversion.transfer {
            Some(transfer) => transfer.check_timeout(now).is_err(),
            None => now.saturating_duration_since(conversion.requested) > ctx.config().transfer_timeout,
        };
        if !expired {
            return None;
        }
        warn!("Drop transfer timed out");
        self.fail(ctx, handler, TransferError::Timeout)
    }

    fn handle_message<C, H>(
        &mut self,
        ctx: &ProtocolContext<C>,
        handler: &mut H,
        window: Window,
        message: XdndMessage,
        now: Instant,
    ) -> Option<DropOutcome>
    where
        C: DisplayConnection,
        H: DndHandler + ?Sized,
    {
        match message {
            XdndMessage::Enter {
                source,
                version,
                more_types,
                types,
            } => self.handle_enter(ctx, handler, window, source, version, more_types, types),
            XdndMessage::Position {
                source,
                point,
                time,
                action,
            } => {
                let session = self.session.as_ref()?;
                if session.source != source || session.conversion.is_some() {
                    trace!(source, "Ignoring XdndPosition outside of a session");
                    return None;
                }
                if let Err(err) = self.handle_position(ctx, handler, point, time, action) {
                    warn!(?err, "Failed to answer XdndPosition");
                    let source = self.abort(handler);
                    return Some(DropOutcome::Failed {
                        source,
                        reason: err.into(),
                    });
                }
                None
            }
            XdndMessage::Drop { source, time } => {
                let session = self.session.as_ref()?;
                if session.source != source || session.conversion.is_some() {
                    trace!(source, "Ignoring XdndDrop outside of a session");
                    return None;
                }
                match self.handle_drop(ctx, handler, time, now) {
                    Ok(outcome) => outcome,
                    Err(err) => self.fail(ctx, handler, err),
                }
            }
            XdndMessage::Leave { source } => {
                let session = self.session.as_ref()?;
                if session.source != source || session.conversion.is_some() {
                    return None;
                }
                debug!(source, "Drag left");
                let source = self.abort(handler);
                Some(DropOutcome::Left { source })
            }
            XdndMessage::Status { .. } | XdndMessage::Finished { .. } => None,
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn handle_enter<C, H>(
        &mut self,
        ctx: &ProtocolContext<C>,
        handler: &mut H,
        toplevel: Window,
        source: Window,
        version: u32,
        more_types: bool,
        inline: [Atom; 3],
    ) -> Option<DropOutcome>
    where
        C: DisplayConnection,
        H: DndHandler + ?Sized,
    {
        let Some(negotiated) = ctx.negotiate_version(version) else {
            debug!(source, version, "Rejecting XdndEnter of unsupported version");
            return None;
        };

        // a new drag ends the previous session, the old source still gets its answer
        let converting = self.session.as_ref().map(|previous| previous.conversion.is_some());
        let outcome = match converting {
            Some(true) => self.fail(ctx, handler, TransferError::Superseded),
            Some(false) => {
                let source = self.abort(handler);
                debug!(source, "Dropping stale drop session");
                Some(DropOutcome::Left { source })
            }
            None => None,
        };

        let types = if more_types {
            match TypeList::fetch(
                ctx.connection(),
                ctx.atoms(),
                source,
                ctx.config().max_property_length,
            ) {
                Ok(types) if !types.is_empty() => types,
                Ok(_) => inline.into_iter().collect(),
                Err(err) => {
                    warn!(source, ?err, "Failed to read XdndTypeList");
                    inline.into_iter().collect()
                }
            }
        } else {
            inline.into_iter().collect()
        };

        debug!(source, toplevel, version = negotiated, ?types, "Drag entered");
        self.session = Some(DropSession {
            source,
            toplevel,
            subwindow: toplevel,
            version: negotiated,
            types,
            desired_type: None,
            will_accept: false,
            action: None,
            position_seen: false,
            last_time: Timestamp::default(),
            conversion: None,
        });
        outcome
    }

    fn handle_position<C, H>(
        &mut self,
        ctx: &ProtocolContext<C>,
        handler: &mut H,
        point: Point,
        time: Timestamp,
        action: Option<DndAction>,
    ) -> Result<(), ConnectionError>
    where
        C: DisplayConnection,
        H: DndHandler + ?Sized,
    {
        let Some(session) = self.session.as_mut() else {
            return Ok(());
        };
        let conn = ctx.connection();

        let window = if session.version >= 3 {
            descend(conn, session.toplevel, point)?
                .last()
                .copied()
                .unwrap_or(session.toplevel)
        } else {
            session.toplevel
        };
        if window != session.subwindow {
            if session.position_seen {
                handler.apply_leave_visual(session.subwindow);
            }
            session.subwindow = window;
        }

        let proposed = action.unwrap_or(DndAction::Copy);
        let reply = handler.apply_position(PositionRequest {
            window,
            source: session.source,
            action: proposed,
            point,
            time,
            types: &session.types,
        });

        session.position_seen = true;
        session.last_time = time;
        let negotiated = reply.negotiate(proposed, session.types.as_slice(), &ctx.config().supported_actions);
        if reply.accept && negotiated.is_none() {
            debug!(
                window,
                desired = ?reply.desired_type,
                action = ?reply.action,
                "Refusing position, type or action is not available"
            );
        }
        session.will_accept = negotiated.is_some();
        session.action = negotiated.map(|(action, _)| action);
        session.desired_type = negotiated.map(|(_, type_)| type_);
        trace!(window, accept = session.will_accept, action = ?session.action, "Answering XdndPosition");

        let status = XdndMessage::Status {
            target: session.toplevel,
            accept: session.will_accept,
            want_position: reply.want_position,
            rect: reply.rect,
            action: session.action,
        };
        conn.send_client_message(
            session.source,
            status.encode(session.source, ctx.atoms(), session.version),
        )?;
        conn.flush()
    }

    fn handle_drop<C, H>(
        &mut self,
        ctx: &ProtocolContext<C>,
        handler: &mut H,
        time: Timestamp,
        now: Instant,
    ) -> Result<Option<DropOutcome>, TransferError>
    where
        C: DisplayConnection,
        H: DndHandler + ?Sized,
    {
        let Some(session) = self.session.as_mut() else {
            return Ok(None);
        };
        let conn = ctx.connection();
        let (Some(type_), Some(mut action)) = (session.desired_type, session.action) else {
            debug!(source = session.source, "Refusing drop");
            return Ok(self.reject(ctx, handler));
        };
        if !session.position_seen || !session.will_accept {
            return Ok(self.reject(ctx, handler));
        }

        if action == DndAction::Ask {
            let list = ActionList::fetch(conn, ctx.atoms(), session.source, ctx.config().max_property_length)?;
            if !list.is_empty() {
                let chosen = handler
                    .choose_action(&list.descriptions(), &list.actions())
                    .and_then(|chosen| negotiate_action(chosen, &ctx.config().supported_actions));
                match chosen {
                    Some(chosen) => action = chosen,
                    None => {
                        debug!(source = session.source, "No action chosen for ask drop");
                        return Ok(self.reject(ctx, handler));
                    }
                }
            }
            session.action = Some(action);
        }

        if !time.is_current_time() {
            session.last_time = time;
        }
        let property = ctx.payload_property();
        debug!(source = session.source, type_, ?action, "Converting drop data");
        conn.select_property_events(session.toplevel)?;
        conn.delete_property(session.toplevel, property)?;
        conn.convert_selection(
            session.toplevel,
            ctx.atoms().XdndSelection,
            type_,
            property,
            request_time(session.version, time),
        )?;
        conn.flush()?;

        session.conversion = Some(Conversion {
            type_,
            requested: now,
            transfer: None,
            buffer: TransferBuffer::new(),
        });
        Ok(None)
    }

    fn handle_selection_notify<C, H>(
        &mut self,
        ctx: &ProtocolContext<C>,
        handler: &mut H,
        notify: &SelectionNotify,
        now: Instant,
    ) -> Option<DropOutcome>
    where
        C: DisplayConnection,
        H: DndHandler + ?Sized,
    {
        let session = self.session.as_mut()?;
        let conversion = session.conversion.as_mut()?;
        let property = ctx.payload_property();
        if notify.requestor != session.toplevel
            || notify.selection != ctx.atoms().XdndSelection
            || conversion.transfer.is_some()
            || (notify.property != property && notify.property != NONE)
        {
            return None;
        }

        if notify.property == NONE {
            let reason = match ctx.connection().selection_owner(ctx.atoms().XdndSelection) {
                Ok(NONE) => TransferError::NoSelectionOwner,
                Ok(_) => TransferError::Refused,
                Err(err) => err.into(),
            };
            warn!(source = session.source, %reason, "Drag source did not convert the selection");
            return self.fail(ctx, handler, reason);
        }

        let start = IncomingTransfer::start(
            ctx.connection(),
            ctx.atoms(),
            session.toplevel,
            property,
            ctx.config(),
            now,
        );
        match start {
            Ok(TransferStart::Complete { data, .. }) => {
                let delivered = handler.insert_payload(
                    &data,
                    0,
                    session.subwindow,
                    session.source,
                    conversion.type_,
                );
                if !delivered {
                    return self.fail(ctx, handler, TransferError::Rejected);
                }
                self.complete(ctx, handler, data.len())
            }
            Ok(TransferStart::Incremental(transfer)) => {
                conversion.transfer = Some(transfer);
                None
            }
            Err(err) => self.fail(ctx, handler, err),
        }
    }

    fn handle_property_notify<C, H>(
        &mut self,
        ctx: &ProtocolContext<C>,
        handler: &mut H,
        notify: &PropertyNotify,
        now: Instant,
    ) -> Option<DropOutcome>
    where
        C: DisplayConnection,
        H: DndHandler + ?Sized,
    {
        let session = self.session.as_mut()?;
        let conversion = session.conversion.as_mut()?;
        let transfer = conversion.transfer.as_mut()?;
        if !transfer.matches(notify) {
            return None;
        }

        match transfer.handle_property_notify(ctx.connection(), notify, now) {
            Ok(TransferStep::Ignored) => None,
            Ok(TransferStep::Chunk(chunk)) => {
                if ctx.config().buffer_incoming {
                    conversion.buffer.push(&chunk);
                    return None;
                }
                if handler.insert_payload(&chunk, 0, session.subwindow, session.source, conversion.type_) {
                    None
                } else {
                    self.fail(ctx, handler, TransferError::Rejected)
                }
            }
            Ok(TransferStep::Finished) => {
                let len = transfer.received();
                if ctx.config().buffer_incoming {
                    let delivered = !conversion.buffer.is_empty()
                        && handler.insert_payload(
                            conversion.buffer.as_slice(),
                            0,
                            session.subwindow,
                            session.source,
                            conversion.type_,
                        );
                    if !delivered {
                        return self.fail(ctx, handler, TransferError::Rejected);
                    }
                }
                self.complete(ctx, handler, len)
            }
            Err(err) => self.fail(ctx, handler, err),
        }
    }

    fn complete<C, H>(&mut self, ctx: &ProtocolContext<C>, handler: &mut H, len: usize) -> Option<DropOutcome>
    where
        C: DisplayConnection,
        H: DndHandler + ?Sized,
    {
        let session = self.session.take()?;
        let type_ = session.conversion.as_ref().map_or(NONE, |conversion| conversion.type_);
        let action = session.action.unwrap_or(DndAction::Copy);
        send_finished(ctx, &session, true);
        handler.apply_leave_visual(session.subwindow);
        debug!(source = session.source, len, ?action, "Drop completed");
        Some(DropOutcome::Completed {
            source: session.source,
            window: session.subwindow,
            type_,
            action,
            len,
        })
    }

    fn reject<C, H>(&mut self, ctx: &ProtocolContext<C>, handler: &mut H) -> Option<DropOutcome>
    where
        C: DisplayConnection,
        H: DndHandler + ?Sized,
    {
        let session = self.session.take()?;
        send_finished(ctx, &session, false);
        handler.apply_leave_visual(session.subwindow);
        Some(DropOutcome::Rejected {
            source: session.source,
        })
    }

    fn fail<C, H>(&mut self, ctx: &ProtocolContext<C>, handler: &mut H, reason: TransferError) -> Option<DropOutcome>
    where
        C: DisplayConnection,
        H: DndHandler + ?Sized,
    {
        let session = self.session.take()?;
        warn!(source = session.source, %reason, "Drop failed");
        if let Err(err) = ctx.connection().delete_property(session.toplevel, ctx.payload_property()) {
            warn!(toplevel = session.toplevel, ?err, "Failed to clean up the drop property");
        }
        send_finished(ctx, &session, false);
        handler.apply_leave_visual(session.subwindow);
        Some(DropOutcome::Failed {
            source: session.source,
            reason,
        })
    }

    fn abort<H: DndHandler + ?Sized>(&mut self, handler: &mut H) -> Window {
        match self.session.take() {
            Some(session) => {
                handler.apply_leave_visual(session.subwindow);
                session.source
            }
            None => NONE,
        }
    }
}

fn send_finished<C: DisplayConnection>(ctx: &ProtocolContext<C>, session: &DropSession, accepted: bool) {
    if session.version < 2 {
        return;
    }
    let message = XdndMessage::Finished {
        target: session.toplevel,
        accepted,
        action: session.action,
    }
    .encode(session.source, ctx.atoms(), session.version);
    let conn = ctx.connection();
    if let Err(err) = conn.send_client_message(session.source, message).and_then(|_| conn.flush()) {
        warn!(source = session.source, ?err, "Failed to send XdndFinished");
    }
}

#[cfg(all(test, feature = "backend_dummy"))]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{
        connection::{
            dummy::{DummyConnection, DummyServer},
            predefined, ClientMessage, DisplayConnection,
        },
        utils::Rectangle,
        xdnd::{testing::*, DndConfig, VersionPolicy},
    };

    struct Fixture {
        server: DummyServer,
        ctx: ProtocolContext<DummyConnection>,
        source: DummyConnection,
        source_window: Window,
        toplevel: Window,
        child: Window,
        handler: RecordingHandler,
        controller: DropController,
    }

    impl Fixture {
        fn new(config: DndConfig) -> Self {
            let (server, ctx) = context(config);
            let conn = ctx.connection();
            let toplevel = conn.create_window(conn.root(), Rectangle::from_loc_and_size((100, 100), (400, 400)));
            let child = conn.create_window(toplevel, Rectangle::from_loc_and_size((50, 50), (100, 100)));
            let source = server.connect();
            let source_window = source.create_window(source.root(), Rectangle::from_loc_and_size((0, 0), (50, 50)));
            Fixture {
                server,
                ctx,
                source,
                source_window,
                toplevel,
                child,
                handler: RecordingHandler {
                    accept: Some((DndAction::Copy, None)),
                    ..Default::default()
                },
                controller: DropController::new(),
            }
        }

        fn send(&mut self, message: XdndMessage, version: u32) -> Option<DropOutcome> {
            let message = message.encode(self.toplevel, self.ctx.atoms(), version);
            self.deliver(message)
        }

        fn deliver(&mut self, message: ClientMessage) -> Option<DropOutcome> {
            self.source.send_client_message(self.toplevel, message).unwrap();
            self.pump()
        }

        fn pump(&mut self) -> Option<DropOutcome> {
            let mut outcome = None;
            while let Some(event) = self.ctx.connection().next_event() {
                if let Some(result) = self.controller.handle_event(&self.ctx, &mut self.handler, &event) {
                    outcome = Some(result);
                }
            }
            outcome
        }

        fn enter(&mut self, types: [Atom; 3], version: u32) {
            self.send(
                XdndMessage::Enter {
                    source: self.source_window,
                    version,
                    more_types: false,
                    types,
                },
                version,
            );
        }

        fn position(&mut self, point: Point) {
            self.send(
                XdndMessage::Position {
                    source: self.source_window,
                    point,
                    time: Timestamp(20),
                    action: Some(DndAction::Copy),
                },
                5,
            );
        }

        fn drop(&mut self) -> Option<DropOutcome> {
            self.send(
                XdndMessage::Drop {
                    source: self.source_window,
                    time: Timestamp(30),
                },
                5,
            )
        }

        fn own_selection(&self) {
            self.source
                .set_selection_owner(self.source_window, self.ctx.atoms().XdndSelection, Timestamp(1))
                .unwrap();
        }

        /// Answer the pending conversion like a selection owner, `None` refuses it
        fn answer(&mut self, data: Option<&[u8]>) -> Option<DropOutcome> {
            let Some(Event::SelectionRequest(request)) = self.source.next_event() else {
                panic!("expected a selection request");
            };
            let property = match data {
                Some(data) => {
                    self.source
                        .change_property8(request.requestor, request.property, request.target, data)
                        .unwrap();
                    request.property
                }
                None => NONE,
            };
            self.source
                .send_selection_notify(SelectionNotify {
                    requestor: request.requestor,
                    selection: request.selection,
                    target: request.target,
                    property,
                    time: request.time,
                })
                .unwrap();
            self.pump()
        }

        fn received(&self) -> Vec<XdndMessage> {
            let mut messages = Vec::new();
            while let Some(event) = self.source.next_event() {
                if let Event::ClientMessage(message) = event {
                    messages.extend(XdndMessage::decode(&message, self.ctx.atoms()));
                }
            }
            messages
        }
    }

    #[test]
    fn status_only_after_position() {
        let mut fixture = Fixture::new(DndConfig::default());
        fixture.enter([predefined::STRING, NONE, NONE], 5);
        assert_eq!(fixture.controller.stage(), DropStage::Entered);
        assert!(fixture.received().is_empty());

        fixture.position(Point::new(120, 120));
        let replies = fixture.received();
        assert_eq!(replies.len(), 1);
        assert!(matches!(
            replies[0],
            XdndMessage::Status {
                accept: true,
                action: Some(DndAction::Copy),
                ..
            }
        ));
    }

    #[test]
    fn status_is_addressed_from_toplevel() {
        let mut fixture = Fixture::new(DndConfig::default());
        fixture.enter([predefined::STRING, NONE, NONE], 5);
        fixture.position(Point::new(170, 170));

        let target = fixture.toplevel;
        assert!(matches!(fixture.received()[..], [XdndMessage::Status { target: t, .. }] if t == target));
        assert_eq!(fixture.handler.positions[0].0, fixture.child);
        assert_eq!(fixture.controller.session().unwrap().subwindow(), fixture.child);

        // leaving the child resets its highlight
        fixture.position(Point::new(120, 120));
        assert_eq!(fixture.handler.left, vec![fixture.child]);
        assert_eq!(fixture.handler.positions[1].0, fixture.toplevel);
    }

    #[test]
    fn drop_requires_matching_source() {
        let mut fixture = Fixture::new(DndConfig::default());
        assert!(fixture.drop().is_none());
        assert_eq!(fixture.controller.stage(), DropStage::Idle);

        fixture.enter([predefined::STRING, NONE, NONE], 5);
        fixture.position(Point::new(120, 120));
        fixture.received();

        let foreign = XdndMessage::Drop {
            source: 4242,
            time: Timestamp(30),
        };
        assert!(fixture.send(foreign, 5).is_none());
        assert_eq!(fixture.controller.stage(), DropStage::Entered);
        assert!(fixture.received().is_empty());
    }

    #[test]
    fn leave_while_idle_is_ignored() {
        let mut fixture = Fixture::new(DndConfig::default());
        let leave = XdndMessage::Leave {
            source: fixture.source_window,
        };
        assert!(fixture.send(leave, 5).is_none());
        assert_eq!(fixture.controller.stage(), DropStage::Idle);
        assert!(fixture.handler.left.is_empty());

        fixture.enter([predefined::STRING, NONE, NONE], 5);
        assert!(fixture.send(XdndMessage::Leave { source: 4242 }, 5).is_none());
        assert_eq!(fixture.controller.stage(), DropStage::Entered);

        assert!(matches!(fixture.send(leave, 5), Some(DropOutcome::Left { .. })));
        assert_eq!(fixture.controller.stage(), DropStage::Idle);
        assert_eq!(fixture.handler.left, vec![fixture.toplevel]);
    }

    #[test]
    fn drop_without_position_is_rejected() {
        let mut fixture = Fixture::new(DndConfig::default());
        fixture.enter([predefined::STRING, NONE, NONE], 5);
        assert!(matches!(fixture.drop(), Some(DropOutcome::Rejected { .. })));
        assert!(matches!(
            fixture.received()[..],
            [XdndMessage::Finished { accepted: false, .. }]
        ));
        assert_eq!(fixture.controller.stage(), DropStage::Idle);
    }

    #[test]
    fn rejected_position_refuses_drop() {
        let mut fixture = Fixture::new(DndConfig::default());
        fixture.handler.accept = None;
        fixture.enter([predefined::STRING, NONE, NONE], 5);
        fixture.position(Point::new(120, 120));
        assert!(matches!(
            fixture.received()[..],
            [XdndMessage::Status {
                accept: false,
                action: None,
                ..
            }]
        ));
        assert!(matches!(fixture.drop(), Some(DropOutcome::Rejected { .. })));
    }

    #[test]
    fn strict_policy_ignores_old_sources() {
        let mut fixture = Fixture::new(DndConfig {
            version_policy: VersionPolicy::Strict,
            ..Default::default()
        });
        fixture.enter([predefined::STRING, NONE, NONE], 2);
        assert_eq!(fixture.controller.stage(), DropStage::Idle);

        fixture.enter([predefined::STRING, NONE, NONE], 3);
        assert_eq!(fixture.controller.session().unwrap().version(), 3);
    }

    #[test]
    fn long_type_lists_are_read_from_source() {
        let mut fixture = Fixture::new(DndConfig::default());
        let types = TypeList::from(&[200, 201, 202, 203][..]);
        types
            .store(&fixture.source, fixture.ctx.atoms(), fixture.source_window)
            .unwrap();
        let source = fixture.source_window;
        fixture.send(
            XdndMessage::Enter {
                source,
                version: 5,
                more_types: true,
                types: types.inline(),
            },
            5,
        );
        assert_eq!(fixture.controller.session().unwrap().types(), &types);
    }

    #[test]
    fn missing_owner_finishes_with_error() {
        let mut fixture = Fixture::new(DndConfig::default());
        fixture.enter([predefined::STRING, NONE, NONE], 5);
        fixture.position(Point::new(120, 120));
        fixture.received();

        // nobody owns XdndSelection, the server answers the conversion with NONE
        let outcome = fixture.drop();
        assert!(matches!(
            outcome,
            Some(DropOutcome::Failed {
                reason: TransferError::NoSelectionOwner,
                ..
            })
        ));
        assert!(matches!(
            fixture.received()[..],
            [XdndMessage::Finished { accepted: false, .. }]
        ));
    }

    #[test]
    fn unrelated_selection_events_are_ignored() {
        let mut fixture = Fixture::new(DndConfig::default());
        fixture.enter([predefined::STRING, NONE, NONE], 5);
        fixture.position(Point::new(120, 120));
        fixture
            .source
            .set_selection_owner(fixture.source_window, fixture.ctx.atoms().XdndSelection, Timestamp(1))
            .unwrap();
        assert!(fixture.drop().is_none());
        assert_eq!(fixture.controller.stage(), DropStage::Converting);

        let clipboard = fixture.ctx.connection().intern_atom("CLIPBOARD").unwrap();
        let foreign = Event::SelectionNotify(SelectionNotify {
            requestor: fixture.toplevel,
            selection: clipboard,
            target: predefined::STRING,
            property: NONE,
            time: Timestamp(30),
        });
        assert!(fixture
            .controller
            .handle_event(&fixture.ctx, &mut fixture.handler, &foreign)
            .is_none());
        assert_eq!(fixture.controller.stage(), DropStage::Converting);
    }

    #[test]
    fn conversion_watchdog() {
        let mut fixture = Fixture::new(DndConfig::default());
        fixture.enter([predefined::STRING, NONE, NONE], 5);
        fixture.position(Point::new(120, 120));
        fixture
            .source
            .set_selection_owner(fixture.source_window, fixture.ctx.atoms().XdndSelection, Timestamp(1))
            .unwrap();
        fixture.drop();
        fixture.received();

        let now = Instant::now();
        assert!(fixture
            .controller
            .dispatch_timeouts(&fixture.ctx, &mut fixture.handler, now + Duration::from_secs(1))
            .is_none());
        let outcome = fixture.controller.dispatch_timeouts(
            &fixture.ctx,
            &mut fixture.handler,
            now + Duration::from_secs(6),
        );
        assert!(matches!(
            outcome,
            Some(DropOutcome::Failed {
                reason: TransferError::Timeout,
                ..
            })
        ));
        assert!(matches!(
            fixture.received()[..],
            [XdndMessage::Finished { accepted: false, .. }]
        ));
    }

    #[test]
    fn incremental_drop_in_chunks() {
        let mut fixture = Fixture::new(DndConfig {
            buffer_incoming: false,
            ..Default::default()
        });
        fixture.enter([predefined::STRING, NONE, NONE], 5);
        fixture.position(Point::new(120, 120));
        fixture.received();
        let selection = fixture.ctx.atoms().XdndSelection;
        fixture
            .source
            .set_selection_owner(fixture.source_window, selection, Timestamp(1))
            .unwrap();
        fixture.drop();

        // play the selection owner by hand
        let Some(Event::SelectionRequest(request)) = fixture.source.next_event() else {
            panic!("expected a selection request");
        };
        assert_eq!(request.property, fixture.ctx.payload_property());
        fixture.server.feed_incr(
            request.requestor,
            request.property,
            request.target,
            vec![b"hello ".to_vec(), b"world".to_vec(), Vec::new()],
        );
        fixture
            .source
            .change_property32(request.requestor, request.property, fixture.ctx.atoms().INCR, &[11])
            .unwrap();
        fixture
            .source
            .send_selection_notify(SelectionNotify {
                requestor: request.requestor,
                selection,
                target: request.target,
                property: request.property,
                time: request.time,
            })
            .unwrap();

        let outcome = fixture.pump();
        assert!(matches!(
            outcome,
            Some(DropOutcome::Completed {
                len: 11,
                action: DndAction::Copy,
                ..
            })
        ));
        assert_eq!(fixture.handler.inserts.len(), 2);
        assert_eq!(fixture.handler.received(), b"hello world");
        assert!(matches!(
            fixture.received()[..],
            [XdndMessage::Finished {
                accepted: true,
                action: Some(DndAction::Copy),
                ..
            }]
        ));
    }

    #[test]
    fn unoffered_type_is_refused() {
        let mut fixture = Fixture::new(DndConfig::default());
        let png = fixture.ctx.connection().intern_atom("image/png").unwrap();
        fixture.handler.accept = Some((DndAction::Copy, Some(png)));
        fixture.enter([predefined::STRING, NONE, NONE], 5);
        fixture.position(Point::new(120, 120));
        assert!(matches!(
            fixture.received()[..],
            [XdndMessage::Status {
                accept: false,
                action: None,
                ..
            }]
        ));
        assert!(!fixture.controller.session().unwrap().will_accept());
        assert!(matches!(fixture.drop(), Some(DropOutcome::Rejected { .. })));
        assert!(fixture.handler.inserts.is_empty());
    }

    #[test]
    fn unsupported_action_is_refused() {
        let mut fixture = Fixture::new(DndConfig {
            supported_actions: vec![DndAction::Copy],
            ..Default::default()
        });
        fixture.handler.accept = Some((DndAction::Move, None));
        fixture.enter([predefined::STRING, NONE, NONE], 5);
        fixture.position(Point::new(120, 120));
        assert!(matches!(
            fixture.received()[..],
            [XdndMessage::Status { accept: false, .. }]
        ));

        fixture.handler.accept = Some((DndAction::Copy, None));
        fixture.position(Point::new(120, 120));
        assert!(matches!(
            fixture.received()[..],
            [XdndMessage::Status {
                accept: true,
                action: Some(DndAction::Copy),
                ..
            }]
        ));
        assert_eq!(fixture.controller.session().unwrap().desired_type(), Some(predefined::STRING));
    }

    #[test]
    fn refused_conversion_is_reported() {
        let mut fixture = Fixture::new(DndConfig::default());
        fixture.enter([predefined::STRING, NONE, NONE], 5);
        fixture.position(Point::new(120, 120));
        fixture.received();
        fixture.own_selection();
        assert!(fixture.drop().is_none());

        let outcome = fixture.answer(None);
        assert!(matches!(
            outcome,
            Some(DropOutcome::Failed {
                reason: TransferError::Refused,
                ..
            })
        ));
        assert!(matches!(
            fixture.received()[..],
            [XdndMessage::Finished { accepted: false, .. }]
        ));
    }

    #[test]
    fn new_drag_supersedes_conversion() {
        let mut fixture = Fixture::new(DndConfig::default());
        fixture.enter([predefined::STRING, NONE, NONE], 5);
        fixture.position(Point::new(120, 120));
        fixture.own_selection();
        fixture.drop();
        fixture.received();
        assert_eq!(fixture.controller.stage(), DropStage::Converting);

        let other = fixture
            .source
            .create_window(fixture.source.root(), Rectangle::from_loc_and_size((60, 0), (50, 50)));
        let outcome = fixture.send(
            XdndMessage::Enter {
                source: other,
                version: 5,
                more_types: false,
                types: [predefined::STRING, NONE, NONE],
            },
            5,
        );
        assert!(matches!(
            outcome,
            Some(DropOutcome::Failed {
                source,
                reason: TransferError::Superseded,
            }) if source == fixture.source_window
        ));
        assert!(matches!(
            fixture.received()[..],
            [XdndMessage::Finished { accepted: false, .. }]
        ));
        assert_eq!(fixture.controller.stage(), DropStage::Entered);
        assert_eq!(fixture.controller.session().unwrap().source(), other);
    }

    #[test]
    fn old_sources_get_no_finished() {
        let mut fixture = Fixture::new(DndConfig::default());
        fixture.enter([predefined::STRING, NONE, NONE], 1);
        fixture.position(Point::new(120, 120));
        assert!(matches!(
            fixture.received()[..],
            [XdndMessage::Status { accept: true, .. }]
        ));
        fixture.own_selection();
        assert!(fixture.drop().is_none());

        let outcome = fixture.answer(Some(b"version one"));
        assert!(matches!(outcome, Some(DropOutcome::Completed { len: 11, .. })));
        assert_eq!(fixture.handler.received(), b"version one");
        assert!(fixture.received().is_empty());
    }

    #[test]
    fn silent_incremental_transfer_times_out() {
        let mut fixture = Fixture::new(DndConfig::default());
        fixture.enter([predefined::STRING, NONE, NONE], 5);
        fixture.position(Point::new(120, 120));
        fixture.received();
        fixture.own_selection();
        fixture.drop();

        // announce an incremental transfer, then never send a chunk
        let Some(Event::SelectionRequest(request)) = fixture.source.next_event() else {
            panic!("expected a selection request");
        };
        fixture
            .source
            .change_property32(request.requestor, request.property, fixture.ctx.atoms().INCR, &[4096])
            .unwrap();
        fixture
            .source
            .send_selection_notify(SelectionNotify {
                requestor: request.requestor,
                selection: request.selection,
                target: request.target,
                property: request.property,
                time: request.time,
            })
            .unwrap();
        assert!(fixture.pump().is_none());
        assert_eq!(fixture.controller.stage(), DropStage::Converting);

        let now = Instant::now();
        assert!(fixture
            .controller
            .dispatch_timeouts(&fixture.ctx, &mut fixture.handler, now)
            .is_none());
        let outcome = fixture.controller.dispatch_timeouts(
            &fixture.ctx,
            &mut fixture.handler,
            now + Duration::from_secs(6),
        );
        assert!(matches!(
            outcome,
            Some(DropOutcome::Failed {
                reason: TransferError::Timeout,
                ..
            })
        ));
        assert!(fixture.handler.inserts.is_empty());
        assert!(matches!(
            fixture.received()[..],
            [XdndMessage::Finished { accepted: false, .. }]
        ));
        assert!(fixture.server.property(fixture.toplevel, fixture.ctx.payload_property()).is_none());
    }
}
