#![allow(dead_code)]

use std::{collections::HashMap, sync::Arc};

use xdnd::{
    connection::{
        dummy::{DummyConnection, DummyServer},
        Atom, ButtonEvent, DisplayConnection, Event, MotionEvent, Window,
    },
    utils::{Point, Rectangle, Timestamp},
    xdnd::{
        aware::mark_aware, DndAction, DndConfig, DndHandler, DragController, DragOffer, DragOutcome,
        DropController, DropOutcome, PositionReply, PositionRequest, ProtocolContext,
    },
};

pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A client taking part in drags
#[derive(Debug, Default)]
pub struct Host {
    pub windows: Vec<Window>,
    pub accept: Option<(DndAction, Option<Atom>)>,
    pub payloads: HashMap<Atom, Vec<u8>>,
    pub received: Vec<u8>,
    pub chunks: usize,
    pub received_type: Option<Atom>,
    pub chosen: Option<DndAction>,
}

impl DndHandler for Host {
    fn window_belongs_to_us(&self, window: Window) -> bool {
        self.windows.contains(&window)
    }

    fn apply_leave_visual(&mut self, _window: Window) {}

    fn apply_position(&mut self, _request: PositionRequest<'_>) -> PositionReply {
        match self.accept {
            Some((action, desired_type)) => PositionReply::accept(action, desired_type),
            None => PositionReply::reject(),
        }
    }

    fn get_payload(&mut self, _window: Window, type_: Atom) -> Option<Vec<u8>> {
        self.payloads.get(&type_).cloned()
    }

    fn insert_payload(&mut self, data: &[u8], _remaining: usize, _into: Window, _from: Window, type_: Atom) -> bool {
        self.received.extend_from_slice(data);
        self.chunks += 1;
        self.received_type = Some(type_);
        true
    }

    fn choose_action(&mut self, _descriptions: &[String], actions: &[DndAction]) -> Option<DndAction> {
        self.chosen.or_else(|| actions.first().copied())
    }
}

/// One side of a drag
pub struct Client {
    pub conn: Arc<DummyConnection>,
    pub ctx: ProtocolContext<DummyConnection>,
    pub window: Window,
    pub host: Host,
}

impl Client {
    fn new(server: &DummyServer, config: DndConfig, geometry: Rectangle) -> Self {
        let conn = Arc::new(server.connect());
        let ctx = ProtocolContext::new(conn.clone(), config).unwrap();
        let window = conn.create_window(conn.root(), geometry);
        Client {
            conn,
            ctx,
            window,
            host: Host {
                windows: vec![window],
                ..Default::default()
            },
        }
    }

    pub fn atom(&self, name: &str) -> Atom {
        self.conn.intern_atom(name).unwrap()
    }
}

/// Two clients on one display, dragging from `source` to `target`
pub struct Desktop {
    pub server: DummyServer,
    pub source: Client,
    pub target: Client,
    pub drag: DragController,
    pub drop: DropController,
    pub drag_outcome: Option<DragOutcome>,
    pub drop_outcome: Option<DropOutcome>,
    /// Stop delivering events to the target
    pub target_frozen: bool,
    /// Stop delivering events to the source
    pub source_frozen: bool,
}

impl Desktop {
    pub fn new(config: DndConfig) -> Self {
        init_logging();
        let server = DummyServer::new(1920, 1080);
        let source = Client::new(&server, config.clone(), Rectangle::from_loc_and_size((0, 0), (400, 400)));
        let target = Client::new(&server, config, Rectangle::from_loc_and_size((800, 0), (400, 400)));
        mark_aware(&target.ctx, &target.host, target.window, &[]).unwrap();
        Desktop {
            server,
            source,
            target,
            drag: DragController::new(),
            drop: DropController::new(),
            drag_outcome: None,
            drop_outcome: None,
            target_frozen: false,
            source_frozen: false,
        }
    }

    /// Press on the source window and start dragging `offer`
    pub fn begin(&mut self, offer: DragOffer) {
        let time = self.server.advance_time(10);
        self.drag
            .begin(self.source.window, offer, Point::new(50, 50), time)
            .unwrap();
    }

    pub fn motion(&mut self, x: i32, y: i32) {
        let time = self.server.advance_time(10);
        self.source_event(Event::Motion(MotionEvent {
            root: Point::new(x, y),
            time,
        }));
        self.pump();
    }

    pub fn release(&mut self, x: i32, y: i32) {
        let time = self.server.advance_time(10);
        self.source_event(Event::ButtonRelease(ButtonEvent {
            root: Point::new(x, y),
            button: 1,
            time,
        }));
        self.pump();
    }

    pub fn source_event(&mut self, event: Event) {
        if let Some(outcome) = self.drag.handle_event(&self.source.ctx, &mut self.source.host, &event) {
            assert!(self.drag_outcome.is_none(), "drag ended twice");
            self.drag_outcome = Some(outcome);
        }
    }

    /// Deliver queued events to both clients until nothing happens anymore
    pub fn pump(&mut self) {
        loop {
            let mut idle = true;
            while !self.source_frozen {
                let Some(event) = self.source.conn.next_event() else {
                    break;
                };
                idle = false;
                self.source_event(event);
            }
            if !self.target_frozen {
                while let Some(event) = self.target.conn.next_event() {
                    idle = false;
                    if let Some(outcome) = self.drop.handle_event(&self.target.ctx, &mut self.target.host, &event) {
                        assert!(self.drop_outcome.is_none(), "drop ended twice");
                        self.drop_outcome = Some(outcome);
                    }
                }
            }
            if idle {
                break;
            }
        }
    }

    /// Drag from the source into the target and release
    pub fn drag_and_drop(&mut self, offer: DragOffer) {
        self.begin(offer);
        self.motion(200, 200);
        self.motion(900, 100);
        self.motion(950, 150);
        self.release(950, 150);
    }

    /// Replace the protocol context of the target, announcing its version again
    pub fn downgrade_target(&mut self, version: u32) {
        let config = DndConfig {
            version,
            ..self.target.ctx.config().clone()
        };
        self.target.ctx = ProtocolContext::new(self.target.conn.clone(), config).unwrap();
        mark_aware(&self.target.ctx, &self.target.host, self.target.window, &[]).unwrap();
    }

    pub fn now(&self) -> Timestamp {
        self.server.time()
    }
}
