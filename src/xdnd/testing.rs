use std::{collections::HashMap, sync::Arc};

use super::{DndAction, DndConfig, DndHandler, PositionReply, PositionRequest, ProtocolContext};
use crate::{
    connection::{
        dummy::{DummyConnection, DummyServer},
        Atom, ExposeEvent, Window,
    },
    utils::Point,
};

pub(crate) fn context(config: DndConfig) -> (DummyServer, ProtocolContext<DummyConnection>) {
    let server = DummyServer::new(1000, 1000);
    let conn = Arc::new(server.connect());
    let ctx = ProtocolContext::new(conn, config).unwrap();
    (server, ctx)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Insert {
    pub data: Vec<u8>,
    pub remaining: usize,
    pub into: Window,
    pub from: Window,
    pub type_: Atom,
}

/// A host recording every callback
#[derive(Debug, Default)]
pub(crate) struct RecordingHandler {
    pub ours: Vec<Window>,
    /// Answer to positions, `None` rejects
    pub accept: Option<(DndAction, Option<Atom>)>,
    pub want_position: bool,
    pub positions: Vec<(Window, Point, DndAction)>,
    pub left: Vec<Window>,
    pub payloads: HashMap<Atom, Vec<u8>>,
    pub inserts: Vec<Insert>,
    pub refuse_inserts: bool,
    pub exposes: usize,
    pub chosen: Option<DndAction>,
}

impl RecordingHandler {
    pub fn received(&self) -> Vec<u8> {
        self.inserts.iter().flat_map(|insert| insert.data.clone()).collect()
    }
}

impl DndHandler for RecordingHandler {
    fn window_belongs_to_us(&self, window: Window) -> bool {
        self.ours.contains(&window)
    }

    fn apply_leave_visual(&mut self, window: Window) {
        self.left.push(window);
    }

    fn apply_position(&mut self, request: PositionRequest<'_>) -> PositionReply {
        self.positions.push((request.window, request.point, request.action));
        match self.accept {
            Some((action, desired_type)) => PositionReply {
                want_position: self.want_position,
                ..PositionReply::accept(action, desired_type)
            },
            None => PositionReply::reject(),
        }
    }

    fn get_payload(&mut self, _window: Window, type_: Atom) -> Option<Vec<u8>> {
        self.payloads.get(&type_).cloned()
    }

    fn insert_payload(&mut self, data: &[u8], remaining: usize, into: Window, from: Window, type_: Atom) -> bool {
        if self.refuse_inserts {
            return false;
        }
        self.inserts.push(Insert {
            data: data.to_vec(),
            remaining,
            into,
            from,
            type_,
        });
        true
    }

    fn handle_expose(&mut self, _event: &ExposeEvent) {
        self.exposes += 1;
    }

    fn choose_action(&mut self, _descriptions: &[String], actions: &[DndAction]) -> Option<DndAction> {
        self.chosen.or_else(|| actions.first().copied())
    }
}
