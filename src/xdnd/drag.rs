use std::time::Instant;

use tracing::{debug, trace, warn};

use super::{
    aware::{descend, is_aware, proxy_window},
    list::{ActionList, TypeList},
    message::XdndMessage,
    transfer::{refuse_request, OutgoingTransfer},
    DndAction, DndHandler, PositionRequest, ProtocolContext,
};
use crate::{
    connection::{Atom, ConnectionError, DisplayConnection, Event, PropertyNotify, SelectionRequest, Window, NONE},
    utils::{Point, Rectangle, Timestamp},
};

/// Errors of [`DragController::begin`]
#[derive(Debug, thiserror::Error)]
pub enum DragError {
    /// The controller already runs a drag
    #[error("A drag is already in progress")]
    AlreadyActive,
    /// The offer has no types
    #[error("The drag offers no data types")]
    NoTypes,
}

/// What a drag offers
#[derive(Debug, Clone)]
pub struct DragOffer {
    /// Offered data types, most preferred first
    pub types: TypeList,
    /// Proposed action
    pub action: DndAction,
    /// Actions to pick from for [`DndAction::Ask`]
    pub actions: ActionList,
}

impl DragOffer {
    /// Offer `types` with `action`
    pub fn new(types: impl Into<TypeList>, action: DndAction) -> Self {
        DragOffer {
            types: types.into(),
            action,
            actions: ActionList::new(),
        }
    }

    /// Attach the actions to choose from on an `ask` drop
    pub fn with_actions(mut self, actions: ActionList) -> Self {
        self.actions = actions;
        self
    }
}

/// Stage of a [`DragSession`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DragStage {
    /// A button is pressed, but the pointer did not move far enough yet
    Idle,
    /// The drag runs, but the pointer is not over a drop target
    Dragging,
    /// The pointer is over a drop target
    Entered,
    /// The data was dropped, waiting for the target to finish
    Dropped,
}

/// The window a drag is currently over
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropTarget {
    /// One of the host's own windows, handled without any messages
    Internal {
        /// The aware toplevel
        toplevel: Window,
        /// The deepest window under the pointer
        window: Window,
    },
    /// A window of another client
    External {
        /// The aware toplevel
        toplevel: Window,
        /// The deepest window under the pointer
        window: Window,
        /// The window messages are sent to instead of the toplevel
        proxy: Option<Window>,
        /// Negotiated protocol version
        version: u32,
    },
}

impl DropTarget {
    /// The aware toplevel
    pub fn toplevel(&self) -> Window {
        match *self {
            DropTarget::Internal { toplevel, .. } | DropTarget::External { toplevel, .. } => toplevel,
        }
    }

    /// The deepest window under the pointer
    pub fn window(&self) -> Window {
        match *self {
            DropTarget::Internal { window, .. } | DropTarget::External { window, .. } => window,
        }
    }

    fn is_internal(&self) -> bool {
        matches!(self, DropTarget::Internal { .. })
    }

    fn set_window(&mut self, new: Window) {
        match self {
            DropTarget::Internal { window, .. } | DropTarget::External { window, .. } => *window = new,
        }
    }
}

/// How a drag ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DragOutcome {
    /// The button was released before the pointer moved far enough
    NoDrag,
    /// The drag was cancelled by the host
    Cancelled,
    /// No target accepted the drop
    Rejected,
    /// The target did not finish in time
    TimedOut,
    /// The display connection failed
    Failed,
    /// The target performed the drop
    ///
    /// Targets below version 2 never confirm a drop, for them this only means the data
    /// went out or nobody asked for it in time.
    Completed {
        /// The toplevel the data was dropped on
        target: Window,
        /// The performed action
        action: DndAction,
    },
}

impl DragOutcome {
    /// The performed action, `None` if nothing was dropped
    pub fn action(&self) -> Option<DndAction> {
        match self {
            DragOutcome::Completed { action, .. } => Some(*action),
            _ => None,
        }
    }
}

/// How a selection request was answered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Served {
    Ignored,
    Data,
    Refused,
}

/// State of a running drag
#[derive(Debug)]
pub struct DragSession {
    stage: DragStage,
    source: Window,
    offer: DragOffer,
    press: Point,
    created: Timestamp,
    last_time: Timestamp,
    target: Option<DropTarget>,
    want_position: bool,
    ready: bool,
    rect: Rectangle,
    accepted_action: Option<DndAction>,
    accepted_type: Option<Atom>,
    dropped_at: Timestamp,
    grabbed: bool,
    owns_selection: bool,
    outgoing: Vec<OutgoingTransfer>,
}

impl DragSession {
    /// Current stage
    pub fn stage(&self) -> DragStage {
        self.stage
    }

    /// The window the drag started from
    pub fn source(&self) -> Window {
        self.source
    }

    /// What is being dragged
    pub fn offer(&self) -> &DragOffer {
        &self.offer
    }

    /// The window under the pointer, if it takes drops
    pub fn target(&self) -> Option<DropTarget> {
        self.target
    }

    /// Whether the target would accept a drop right now
    pub fn is_ready(&self) -> bool {
        self.ready
    }

    /// The action the target accepted
    pub fn accepted_action(&self) -> Option<DndAction> {
        self.accepted_action
    }

    /// Timestamp of the button press starting the drag
    pub fn created(&self) -> Timestamp {
        self.created
    }

    fn handle_event<C, H>(
        &mut self,
        ctx: &ProtocolContext<C>,
        handler: &mut H,
        event: &Event,
    ) -> Result<Option<DragOutcome>, ConnectionError>
    where
        C: DisplayConnection,
        H: DndHandler + ?Sized,
    {
        if let Some(time) = event.time() {
            if let Some(outcome) = self.expiry(ctx, time) {
                return Ok(Some(outcome));
            }
            if time > self.last_time {
                self.last_time = time;
            }
        }

        match event {
            Event::Motion(motion) => {
                self.handle_motion(ctx, handler, motion.root, motion.time)?;
                Ok(None)
            }
            Event::ButtonRelease(button) => self.handle_release(ctx, handler, button.time),
            Event::ClientMessage(message) if message.window == self.source => {
                match XdndMessage::decode(message, ctx.atoms()) {
                    Some(decoded) => self.handle_message(ctx, decoded),
                    None => Ok(None),
                }
            }
            Event::SelectionRequest(request) => match self.serve_request(ctx, handler, request)? {
                Served::Ignored => Ok(None),
                Served::Data => Ok(self.unconfirmed_completion()),
                Served::Refused if self.unconfirmed_completion().is_some() => Ok(Some(DragOutcome::Rejected)),
                Served::Refused => Ok(None),
            },
            Event::PropertyNotify(notify) => {
                let pending = !self.outgoing.is_empty();
                self.advance_transfers(ctx, notify)?;
                Ok(if pending { self.unconfirmed_completion() } else { None })
            }
            Event::Expose(expose) => {
                if self.stage == DragStage::Dropped {
                    handler.handle_expose(expose);
                }
                Ok(None)
            }
            _ => Ok(None),
        }
    }

    /// How the drag ends if the target stays silent until `now`
    fn expiry<C: DisplayConnection>(&self, ctx: &ProtocolContext<C>, now: Timestamp) -> Option<DragOutcome> {
        if self.stage != DragStage::Dropped {
            return None;
        }
        let elapsed = now.elapsed_since(self.dropped_at);
        if self.awaits_finished() || !self.outgoing.is_empty() {
            return (elapsed > ctx.config().finished_timeout).then_some(DragOutcome::TimedOut);
        }
        // old targets can't tell us they are done
        if elapsed > ctx.config().transfer_timeout {
            self.unconfirmed_completion()
        } else {
            None
        }
    }

    fn awaits_finished(&self) -> bool {
        matches!(self.target, Some(DropTarget::External { version, .. }) if version >= 2)
    }

    /// Completion of a drop on a target too old to send `XdndFinished`, once no data is pending
    fn unconfirmed_completion(&self) -> Option<DragOutcome> {
        match self.target {
            Some(DropTarget::External { toplevel, version, .. })
                if version < 2 && self.stage == DragStage::Dropped && self.outgoing.is_empty() =>
            {
                Some(DragOutcome::Completed {
                    target: toplevel,
                    action: self.accepted_action.unwrap_or(DndAction::Copy),
                })
            }
            _ => None,
        }
    }

    fn handle_motion<C, H>(
        &mut self,
        ctx: &ProtocolContext<C>,
        handler: &mut H,
        point: Point,
        time: Timestamp,
    ) -> Result<(), ConnectionError>
    where
        C: DisplayConnection,
        H: DndHandler + ?Sized,
    {
        match self.stage {
            DragStage::Idle => {
                if point.distance(self.press) <= ctx.config().drag_threshold {
                    return Ok(());
                }
                self.start(ctx, time)?;
            }
            DragStage::Dropped => return Ok(()),
            DragStage::Dragging | DragStage::Entered => {}
        }
        self.update_target(ctx, handler, point, time)
    }

    fn start<C: DisplayConnection>(&mut self, ctx: &ProtocolContext<C>, time: Timestamp) -> Result<(), ConnectionError> {
        let conn = ctx.connection();
        let atoms = ctx.atoms();
        debug!(source = self.source, types = ?self.offer.types, action = ?self.offer.action, "Drag started");

        conn.set_selection_owner(self.source, atoms.XdndSelection, time)?;
        self.owns_selection = true;
        if self.offer.types.needs_property() {
            self.offer.types.store(conn, atoms, self.source)?;
        }
        if !self.offer.actions.is_empty() {
            self.offer.actions.store(conn, atoms, self.source)?;
        }

        match conn.grab_pointer(self.source, ctx.cursors().cursor(None), time) {
            Ok(true) => self.grabbed = true,
            Ok(false) => warn!(source = self.source, "Unable to grab the pointer, dragging without grab"),
            Err(err) => warn!(source = self.source, ?err, "Unable to grab the pointer, dragging without grab"),
        }
        conn.flush()?;
        self.stage = DragStage::Dragging;
        Ok(())
    }

    fn find_target<C, H>(
        &self,
        ctx: &ProtocolContext<C>,
        handler: &H,
        point: Point,
    ) -> Result<Option<DropTarget>, ConnectionError>
    where
        C: DisplayConnection,
        H: DndHandler + ?Sized,
    {
        let conn = ctx.connection();
        let chain = descend(conn, conn.root(), point)?;
        let Some(&deepest) = chain.last() else {
            return Ok(None);
        };

        for &toplevel in &chain {
            let Some((version, proxy)) = self.probe(ctx, toplevel)? else {
                continue;
            };
            let target = if handler.window_belongs_to_us(toplevel) {
                DropTarget::Internal {
                    toplevel,
                    window: deepest,
                }
            } else {
                DropTarget::External {
                    toplevel,
                    window: deepest,
                    proxy,
                    version,
                }
            };
            return Ok(Some(target));
        }
        Ok(None)
    }

    /// Check whether `window` takes drops, with the version and proxy to use
    fn probe<C: DisplayConnection>(
        &self,
        ctx: &ProtocolContext<C>,
        window: Window,
    ) -> Result<Option<(u32, Option<Window>)>, ConnectionError> {
        let probed = proxy_window(ctx, window).and_then(|proxy| {
            let aware = is_aware(ctx, proxy.unwrap_or(window), self.offer.types.as_slice())?;
            Ok((aware, proxy))
        });
        let (aware, proxy) = match probed {
            Ok(probed) => probed,
            // windows may vanish at any time
            Err(ConnectionError::BadWindow(_)) => return Ok(None),
            Err(err) => return Err(err),
        };
        Ok(match aware {
            Some(version) => Some((version, proxy)),
            None if ctx.config().no_hysteresis => Some((ctx.version(), proxy)),
            None => None,
        })
    }

    fn update_target<C, H>(
        &mut self,
        ctx: &ProtocolContext<C>,
        handler: &mut H,
        point: Point,
        time: Timestamp,
    ) -> Result<(), ConnectionError>
    where
        C: DisplayConnection,
        H: DndHandler + ?Sized,
    {
        let found = self.find_target(ctx, handler, point)?;
        let same_toplevel = match (self.target, found) {
            (Some(current), Some(new)) => {
                current.toplevel() == new.toplevel() && current.is_internal() == new.is_internal()
            }
            (None, None) => true,
            _ => false,
        };

        if !same_toplevel {
            self.leave(ctx, handler)?;
            if let Some(target) = found {
                self.enter(ctx, target)?;
            }
        } else if let (Some(current), Some(new)) = (self.target.as_mut(), found) {
            if current.window() != new.window() {
                if current.is_internal() {
                    handler.apply_leave_visual(current.window());
                }
                trace!(from = current.window(), to = new.window(), "Drag moved to another subwindow");
                current.set_window(new.window());
                // a new subwindow has to be asked again
                self.want_position = true;
            }
        }

        if self.target.is_some() {
            self.send_position(ctx, handler, point, time)?;
        }
        Ok(())
    }

    fn enter<C: DisplayConnection>(&mut self, ctx: &ProtocolContext<C>, target: DropTarget) -> Result<(), ConnectionError> {
        if let DropTarget::External {
            toplevel,
            proxy,
            version,
            ..
        } = target
        {
            let message = XdndMessage::Enter {
                source: self.source,
                version,
                more_types: self.offer.types.needs_property(),
                types: self.offer.types.inline(),
            }
            .encode(toplevel, ctx.atoms(), version);
            let conn = ctx.connection();
            conn.send_client_message(proxy.unwrap_or(toplevel), message)?;
            conn.flush()?;
        }
        debug!(?target, "Drag entered target");
        self.target = Some(target);
        self.stage = DragStage::Entered;
        self.reset_status();
        Ok(())
    }

    fn leave<C, H>(&mut self, ctx: &ProtocolContext<C>, handler: &mut H) -> Result<(), ConnectionError>
    where
        C: DisplayConnection,
        H: DndHandler + ?Sized,
    {
        let Some(target) = self.target.take() else {
            return Ok(());
        };
        debug!(?target, "Drag left target");
        if self.stage == DragStage::Entered {
            self.stage = DragStage::Dragging;
        }
        self.reset_status();
        self.update_cursor(ctx);

        match target {
            DropTarget::Internal { window, .. } => {
                handler.apply_leave_visual(window);
                Ok(())
            }
            DropTarget::External {
                toplevel,
                proxy,
                version,
                ..
            } => {
                let message = XdndMessage::Leave { source: self.source }.encode(toplevel, ctx.atoms(), version);
                let conn = ctx.connection();
                conn.send_client_message(proxy.unwrap_or(toplevel), message)?;
                conn.flush()
            }
        }
    }

    fn reset_status(&mut self) {
        self.want_position = true;
        self.ready = false;
        self.rect = Rectangle::default();
        self.accepted_action = None;
        self.accepted_type = None;
    }

    fn send_position<C, H>(
        &mut self,
        ctx: &ProtocolContext<C>,
        handler: &mut H,
        point: Point,
        time: Timestamp,
    ) -> Result<(), ConnectionError>
    where
        C: DisplayConnection,
        H: DndHandler + ?Sized,
    {
        if !self.want_position && self.rect.contains(point) {
            trace!(?point, "Position inside of the status rectangle, not sending");
            return Ok(());
        }

        match self.target {
            Some(DropTarget::External {
                toplevel,
                proxy,
                version,
                ..
            }) => {
                let message = XdndMessage::Position {
                    source: self.source,
                    point,
                    time,
                    action: Some(self.offer.action),
                }
                .encode(toplevel, ctx.atoms(), version);
                let conn = ctx.connection();
                conn.send_client_message(proxy.unwrap_or(toplevel), message)?;
                conn.flush()
            }
            Some(DropTarget::Internal { window, .. }) => {
                let reply = handler.apply_position(PositionRequest {
                    window,
                    source: self.source,
                    action: self.offer.action,
                    point,
                    time,
                    types: &self.offer.types,
                });
                let negotiated = reply.negotiate(
                    self.offer.action,
                    self.offer.types.as_slice(),
                    &ctx.config().supported_actions,
                );
                let action = negotiated.map(|(action, _)| action);
                self.apply_status(ctx, negotiated.is_some(), reply.want_position, reply.rect, action, ctx.version());
                self.accepted_type = negotiated.map(|(_, type_)| type_);
                Ok(())
            }
            None => Ok(()),
        }
    }

    fn apply_status<C: DisplayConnection>(
        &mut self,
        ctx: &ProtocolContext<C>,
        accept: bool,
        want_position: bool,
        rect: Rectangle,
        action: Option<DndAction>,
        version: u32,
    ) {
        self.ready = accept;
        self.want_position = want_position;
        self.rect = rect;
        self.accepted_action = match (accept, version) {
            (false, _) => None,
            (true, 0 | 1) => Some(DndAction::Copy),
            (true, _) => action.or(Some(self.offer.action)),
        };
        trace!(accept, want_position, ?rect, action = ?self.accepted_action, "Drop target status");
        self.update_cursor(ctx);
    }

    fn update_cursor<C: DisplayConnection>(&self, ctx: &ProtocolContext<C>) {
        if !self.grabbed {
            return;
        }
        let action = if self.ready { self.accepted_action } else { None };
        if let Err(err) = ctx
            .connection()
            .change_grab_cursor(ctx.cursors().cursor(action), self.last_time)
        {
            warn!(?err, "Failed to change the drag cursor");
        }
    }

    fn handle_message<C: DisplayConnection>(
        &mut self,
        ctx: &ProtocolContext<C>,
        message: XdndMessage,
    ) -> Result<Option<DragOutcome>, ConnectionError> {
        let Some(DropTarget::External {
            toplevel,
            version,
            ..
        }) = self.target
        else {
            return Ok(None);
        };

        match message {
            XdndMessage::Status {
                target,
                accept,
                want_position,
                rect,
                action,
            } if target == toplevel && self.stage == DragStage::Entered => {
                self.apply_status(ctx, accept, want_position, rect, action, version);
                Ok(None)
            }
            XdndMessage::Finished {
                target,
                accepted,
                action,
            } if target == toplevel && self.stage == DragStage::Dropped => {
                if version >= 5 && !accepted {
                    debug!(target, "Drop target refused the data");
                    return Ok(Some(DragOutcome::Rejected));
                }
                let action = if version >= 5 { action } else { None };
                let action = action.or(self.accepted_action).unwrap_or(DndAction::Copy);
                debug!(target, ?action, "Drop finished");
                Ok(Some(DragOutcome::Completed {
                    target: toplevel,
                    action,
                }))
            }
            _ => Ok(None),
        }
    }

    fn handle_release<C, H>(
        &mut self,
        ctx: &ProtocolContext<C>,
        handler: &mut H,
        time: Timestamp,
    ) -> Result<Option<DragOutcome>, ConnectionError>
    where
        C: DisplayConnection,
        H: DndHandler + ?Sized,
    {
        match self.stage {
            DragStage::Idle => return Ok(Some(DragOutcome::NoDrag)),
            DragStage::Dropped => return Ok(None),
            DragStage::Dragging | DragStage::Entered => {}
        }

        let Some(target) = self.target else {
            debug!(source = self.source, "Released outside of any drop target");
            return Ok(Some(DragOutcome::Rejected));
        };
        if !self.ready {
            self.leave(ctx, handler)?;
            return Ok(Some(DragOutcome::Rejected));
        }

        match target {
            DropTarget::Internal { window, .. } => {
                let action = self.accepted_action.unwrap_or(self.offer.action);
                let delivered = match self.accepted_type {
                    Some(type_) => match handler.get_payload(self.source, type_) {
                        Some(data) => handler.insert_payload(&data, 0, window, self.source, type_),
                        None => false,
                    },
                    None => false,
                };
                handler.apply_leave_visual(window);
                self.target = None;
                if !delivered {
                    return Ok(Some(DragOutcome::Rejected));
                }
                Ok(Some(DragOutcome::Completed {
                    target: target.toplevel(),
                    action,
                }))
            }
            DropTarget::External {
                toplevel,
                proxy,
                version,
                ..
            } => {
                let conn = ctx.connection();
                let message = XdndMessage::Drop {
                    source: self.source,
                    time,
                }
                .encode(toplevel, ctx.atoms(), version);
                conn.send_client_message(proxy.unwrap_or(toplevel), message)?;
                if self.grabbed {
                    conn.ungrab_pointer(time)?;
                    self.grabbed = false;
                }
                conn.flush()?;
                debug!(target = toplevel, version, "Dropped");

                // keep owning XdndSelection until the target fetched the data
                self.stage = DragStage::Dropped;
                self.dropped_at = if time.is_current_time() { self.last_time } else { time };
                Ok(None)
            }
        }
    }

    fn serve_request<C, H>(
        &mut self,
        ctx: &ProtocolContext<C>,
        handler: &mut H,
        request: &SelectionRequest,
    ) -> Result<Served, ConnectionError>
    where
        C: DisplayConnection,
        H: DndHandler + ?Sized,
    {
        if request.selection != ctx.atoms().XdndSelection || request.owner != self.source || !self.owns_selection {
            return Ok(Served::Ignored);
        }

        let conn = ctx.connection();
        let data = if self.offer.types.contains(request.target) {
            handler.get_payload(self.source, request.target)
        } else {
            None
        };
        let Some(data) = data else {
            debug!(requestor = request.requestor, target = request.target, "Refusing selection request");
            refuse_request(conn, request)?;
            return Ok(Served::Refused);
        };

        trace!(requestor = request.requestor, len = data.len(), "Serving drag data");
        if let Some(transfer) = OutgoingTransfer::serve(conn, ctx.atoms(), request, data, ctx.config(), Instant::now())? {
            self.outgoing.push(transfer);
        }
        Ok(Served::Data)
    }

    fn advance_transfers<C: DisplayConnection>(
        &mut self,
        ctx: &ProtocolContext<C>,
        notify: &PropertyNotify,
    ) -> Result<(), ConnectionError> {
        let conn = ctx.connection();
        let now = Instant::now();
        let mut result = Ok(());
        self.outgoing.retain_mut(|transfer| {
            if transfer.is_expired(now) {
                warn!(requestor = transfer.requestor(), "Requestor stopped reading drag data");
                return false;
            }
            match transfer.handle_property_notify(conn, notify, now) {
                Ok(done) => !done,
                Err(err) => {
                    result = Err(err);
                    false
                }
            }
        });
        result
    }

    /// Release every resource the drag holds on the display
    fn cleanup<C: DisplayConnection>(self, ctx: &ProtocolContext<C>) {
        let conn = ctx.connection();
        let atoms = ctx.atoms();
        let mut result = Ok(());
        if self.grabbed {
            result = result.and(conn.ungrab_pointer(self.last_time));
        }
        if self.owns_selection {
            match conn.selection_owner(atoms.XdndSelection) {
                Ok(owner) if owner == self.source => {
                    result = result.and(conn.set_selection_owner(NONE, atoms.XdndSelection, self.last_time));
                }
                Ok(_) => {}
                Err(err) => result = Err(err),
            }
        }
        if self.offer.types.needs_property() {
            result = result.and(conn.delete_property(self.source, atoms.XdndTypeList));
        }
        if !self.offer.actions.is_empty() {
            result = result
                .and(conn.delete_property(self.source, atoms.XdndActionList))
                .and(conn.delete_property(self.source, atoms.XdndActionDescription));
        }
        if let Err(err) = result.and(conn.flush()) {
            warn!(source = self.source, ?err, "Failed to clean up after drag");
        }
    }
}

/// The drag source side of XDND
///
/// A drag is armed with [`DragController::begin`] when a button gets pressed on a draggable
/// window. From then on, every pointer event and every event of the source window has to
/// be passed to [`DragController::handle_event`] until it returns the [`DragOutcome`].
#[derive(Debug, Default)]
pub struct DragController {
    session: Option<DragSession>,
}

impl DragController {
    /// A controller without drag
    pub fn new() -> Self {
        Self::default()
    }

    /// The running drag, if any
    pub fn session(&self) -> Option<&DragSession> {
        self.session.as_ref()
    }

    /// Arm a drag of `offer` from `source`, pressed at `press` in root coordinates
    ///
    /// Nothing happens on the display until the pointer moves further than
    /// [`DndConfig::drag_threshold`](super::DndConfig::drag_threshold).
    pub fn begin(&mut self, source: Window, offer: DragOffer, press: Point, time: Timestamp) -> Result<(), DragError> {
        if self.session.is_some() {
            return Err(DragError::AlreadyActive);
        }
        if offer.types.is_empty() {
            return Err(DragError::NoTypes);
        }
        trace!(source, ?press, "Drag armed");
        self.session = Some(DragSession {
            stage: DragStage::Idle,
            source,
            offer,
            press,
            created: time,
            last_time: time,
            target: None,
            want_position: true,
            ready: false,
            rect: Rectangle::default(),
            accepted_action: None,
            accepted_type: None,
            dropped_at: time,
            grabbed: false,
            owns_selection: false,
            outgoing: Vec::new(),
        });
        Ok(())
    }

    /// Process an event
    ///
    /// Returns `Some` once the drag ended, the controller is ready for the next drag
    /// afterwards.
    pub fn handle_event<C, H>(&mut self, ctx: &ProtocolContext<C>, handler: &mut H, event: &Event) -> Option<DragOutcome>
    where
        C: DisplayConnection,
        H: DndHandler + ?Sized,
    {
        let session = self.session.as_mut()?;
        let outcome = match session.handle_event(ctx, handler, event) {
            Ok(None) => return None,
            Ok(Some(outcome)) => outcome,
            Err(err) => {
                warn!(?err, "Drag aborted");
                if let Err(err) = session.leave(ctx, handler) {
                    debug!(?err, "Unable to leave drop target");
                }
                DragOutcome::Failed
            }
        };
        self.finish(ctx, outcome)
    }

    /// Abort the drag
    ///
    /// The current drop target is left. Returns `None` if no drag was running.
    pub fn cancel<C, H>(&mut self, ctx: &ProtocolContext<C>, handler: &mut H) -> Option<DragOutcome>
    where
        C: DisplayConnection,
        H: DndHandler + ?Sized,
    {
        let session = self.session.as_mut()?;
        if let Err(err) = session.leave(ctx, handler) {
            warn!(?err, "Unable to leave drop target");
        }
        self.finish(ctx, DragOutcome::Cancelled)
    }

    /// End the drag if the target did not finish until `now`
    ///
    /// [`DragController::handle_event`] checks this for every event carrying a timestamp,
    /// hosts may call it from a timer in addition.
    pub fn expire<C: DisplayConnection>(&mut self, ctx: &ProtocolContext<C>, now: Timestamp) -> Option<DragOutcome> {
        let outcome = self.session.as_ref()?.expiry(ctx, now)?;
        if outcome == DragOutcome::TimedOut {
            warn!("Drop target did not finish in time");
        }
        self.finish(ctx, outcome)
    }

    fn finish<C: DisplayConnection>(&mut self, ctx: &ProtocolContext<C>, outcome: DragOutcome) -> Option<DragOutcome> {
        let session = self.session.take()?;
        debug!(source = session.source, ?outcome, "Drag ended");
        session.cleanup(ctx);
        Some(outcome)
    }
}
