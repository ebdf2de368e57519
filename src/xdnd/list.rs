//! Type and action lists
//!
//! A [`TypeList`] is the ordered set of data types a drag source offers. Up to three types
//! travel inline in `XdndEnter`, longer lists are published in the `XdndTypeList` property
//! of the source window. An [`ActionList`] pairs the actions a source supports for `ask`
//! drops with human readable descriptions.

use smallvec::SmallVec;
use tracing::trace;

use super::{Atoms, DndAction};
use crate::connection::{predefined, Atom, ConnectionError, DisplayConnection, Window, NONE};

/// Number of types carried inline by `XdndEnter`
pub const INLINE_TYPES: usize = 3;

/// An ordered list of offered types
///
/// The list never contains [`NONE`]. Building it from an iterator stops at the first
/// [`NONE`], matching the null-terminated wire representation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TypeList(SmallVec<[Atom; 8]>);

impl TypeList {
    /// An empty list
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of types
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the list has no types
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The types as a slice
    pub fn as_slice(&self) -> &[Atom] {
        &self.0
    }

    /// Iterate over the types in order
    pub fn iter(&self) -> impl Iterator<Item = Atom> + '_ {
        self.0.iter().copied()
    }

    /// The first, most preferred type
    pub fn first(&self) -> Option<Atom> {
        self.0.first().copied()
    }

    /// Whether `type_` is part of the list
    pub fn contains(&self, type_: Atom) -> bool {
        self.0.contains(&type_)
    }

    /// Whether the list does not fit into `XdndEnter`
    pub fn needs_property(&self) -> bool {
        self.0.len() > INLINE_TYPES
    }

    /// The first three types, padded with [`NONE`]
    pub fn inline(&self) -> [Atom; INLINE_TYPES] {
        let mut inline = [NONE; INLINE_TYPES];
        for (slot, type_) in inline.iter_mut().zip(self.0.iter()) {
            *slot = *type_;
        }
        inline
    }

    /// Publish the list as `XdndTypeList` on `window`
    pub fn store<C: DisplayConnection + ?Sized>(
        &self,
        conn: &C,
        atoms: &Atoms,
        window: Window,
    ) -> Result<(), ConnectionError> {
        trace!(window, types = ?self, "Storing XdndTypeList");
        conn.change_property32(window, atoms.XdndTypeList, predefined::ATOM, &self.0)
    }

    /// Read the `XdndTypeList` of `window`
    ///
    /// A missing or malformed property yields an empty list.
    pub fn fetch<C: DisplayConnection + ?Sized>(
        conn: &C,
        atoms: &Atoms,
        window: Window,
        max_length: u32,
    ) -> Result<TypeList, ConnectionError> {
        let values = read_property32(conn, window, atoms.XdndTypeList, predefined::ATOM, max_length)?;
        Ok(values.into_iter().flatten().collect())
    }
}

impl FromIterator<Atom> for TypeList {
    fn from_iter<T: IntoIterator<Item = Atom>>(iter: T) -> Self {
        TypeList(iter.into_iter().take_while(|atom| *atom != NONE).collect())
    }
}

impl From<&[Atom]> for TypeList {
    fn from(types: &[Atom]) -> Self {
        types.iter().copied().collect()
    }
}

impl<'a> IntoIterator for &'a TypeList {
    type Item = &'a Atom;
    type IntoIter = std::slice::Iter<'a, Atom>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// Actions offered for an `ask` drop, with their descriptions
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActionList {
    entries: Vec<(DndAction, String)>,
}

impl ActionList {
    /// An empty list
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an action
    ///
    /// Newlines are not allowed in descriptions and get removed.
    pub fn push(&mut self, action: DndAction, description: impl Into<String>) {
        let description = description.into().replace(['\n', '\r'], "");
        self.entries.push((action, description));
    }

    /// Builder variant of [`ActionList::push`]
    pub fn with(mut self, action: DndAction, description: impl Into<String>) -> Self {
        self.push(action, description);
        self
    }

    /// Number of actions
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no action is listed
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The listed actions in order
    pub fn actions(&self) -> Vec<DndAction> {
        self.entries.iter().map(|(action, _)| *action).collect()
    }

    /// The descriptions in order, empty strings for missing ones
    pub fn descriptions(&self) -> Vec<String> {
        self.entries.iter().map(|(_, desc)| desc.clone()).collect()
    }

    /// Publish the list as `XdndActionList` and `XdndActionDescription` on `window`
    pub fn store<C: DisplayConnection + ?Sized>(
        &self,
        conn: &C,
        atoms: &Atoms,
        window: Window,
    ) -> Result<(), ConnectionError> {
        let actions = self
            .entries
            .iter()
            .map(|(action, _)| action.to_atom(atoms))
            .collect::<Vec<_>>();
        conn.change_property32(window, atoms.XdndActionList, predefined::ATOM, &actions)?;

        let mut blob = Vec::new();
        for (_, description) in &self.entries {
            blob.extend_from_slice(description.as_bytes());
            blob.push(0);
        }
        blob.push(0);
        conn.change_property8(window, atoms.XdndActionDescription, predefined::STRING, &blob)
    }

    /// Read the action list of `window`
    ///
    /// Unknown action atoms are skipped together with their description.
    pub fn fetch<C: DisplayConnection + ?Sized>(
        conn: &C,
        atoms: &Atoms,
        window: Window,
        max_length: u32,
    ) -> Result<ActionList, ConnectionError> {
        let Some(actions) = read_property32(conn, window, atoms.XdndActionList, predefined::ATOM, max_length)? else {
            return Ok(ActionList::new());
        };

        let reply = conn.get_property(
            window,
            atoms.XdndActionDescription,
            predefined::STRING,
            0,
            max_length,
        )?;
        let blob = if reply.format == 8 { reply.value } else { Vec::new() };
        let mut descriptions = blob
            .split(|byte| *byte == 0)
            .map(|desc| String::from_utf8_lossy(desc).into_owned());

        let mut list = ActionList::new();
        for atom in actions {
            let description = descriptions.next().unwrap_or_default();
            if let Some(action) = DndAction::from_atom(atom, atoms) {
                list.push(action, description);
            }
        }
        Ok(list)
    }
}

/// Read a format-32 property of the given type
///
/// Returns `None` if the property is missing, of another type or another format.
pub(crate) fn read_property32<C: DisplayConnection + ?Sized>(
    conn: &C,
    window: Window,
    property: Atom,
    type_: Atom,
    max_length: u32,
) -> Result<Option<Vec<u32>>, ConnectionError> {
    let reply = conn.get_property(window, property, type_, 0, max_length)?;
    if reply.type_ != type_ {
        return Ok(None);
    }
    Ok(reply.value32().map(Iterator::collect))
}

/// Pick the type of a drop
///
/// The target's `desired` order wins: the first desired type the source `offered` is chosen.
/// Without any preference the source's first type is used.
pub fn negotiate_type(desired: &[Atom], offered: &[Atom]) -> Option<Atom> {
    if desired.is_empty() {
        return offered.first().copied();
    }
    desired.iter().copied().find(|type_| offered.contains(type_))
}

/// Check a proposed action against the actions a target supports
///
/// A target without any supported actions only accepts `copy`.
pub fn negotiate_action(proposed: DndAction, supported: &[DndAction]) -> Option<DndAction> {
    if supported.is_empty() {
        return (proposed == DndAction::Copy).then_some(DndAction::Copy);
    }
    supported.contains(&proposed).then_some(proposed)
}
