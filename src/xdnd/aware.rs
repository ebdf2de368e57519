//! Announcing and discovering XDND capable windows
//!
//! A window takes part in XDND by carrying an `XdndAware` property holding the highest
//! protocol version it speaks, optionally followed by the types it accepts. Windows may
//! redirect protocol traffic to another window through `XdndProxy`.

use smallvec::SmallVec;
use tracing::{debug, trace};

use super::{
    list::{negotiate_type, read_property32},
    DndHandler, ProtocolContext,
};
use crate::{
    connection::{predefined, Atom, ConnectionError, DisplayConnection, Window, NONE},
    utils::Point,
};

/// Mark `window` as XDND aware, optionally limited to `types`
///
/// If `window` belongs to the host, its ancestors belonging to the host are marked as
/// well, so windows embedding it are found by drag sources.
pub fn mark_aware<C, H>(
    ctx: &ProtocolContext<C>,
    handler: &H,
    window: Window,
    types: &[Atom],
) -> Result<(), ConnectionError>
where
    C: DisplayConnection,
    H: DndHandler + ?Sized,
{
    let conn = ctx.connection();
    let mut data = Vec::with_capacity(types.len() + 1);
    data.push(ctx.version());
    data.extend_from_slice(types);

    let mut current = window;
    loop {
        trace!(window = current, version = ctx.version(), "Marking window XDND aware");
        conn.change_property32(current, ctx.atoms().XdndAware, predefined::ATOM, &data)?;
        if !handler.window_belongs_to_us(current) {
            break;
        }
        match conn.parent(current)? {
            Some(parent) if parent != conn.root() && handler.window_belongs_to_us(parent) => current = parent,
            _ => break,
        }
    }
    Ok(())
}

/// Remove the `XdndAware` property of `window`
pub fn unmark_aware<C: DisplayConnection>(ctx: &ProtocolContext<C>, window: Window) -> Result<(), ConnectionError> {
    ctx.connection().delete_property(window, ctx.atoms().XdndAware)
}

/// Check whether `window` takes part in XDND
///
/// Returns the version to speak with the window, or `None` if it is not aware. A missing,
/// malformed or empty property means the window is not aware, as does a version refused
/// by the [`VersionPolicy`](super::VersionPolicy). If both `types` and the window's own
/// list of accepted types are non-empty, they have to share at least one type.
pub fn is_aware<C: DisplayConnection>(
    ctx: &ProtocolContext<C>,
    window: Window,
    types: &[Atom],
) -> Result<Option<u32>, ConnectionError> {
    let Some(values) = read_property32(
        ctx.connection(),
        window,
        ctx.atoms().XdndAware,
        predefined::ATOM,
        ctx.config().max_property_length,
    )?
    else {
        return Ok(None);
    };
    let Some((&peer, accepted)) = values.split_first() else {
        return Ok(None);
    };

    let Some(version) = ctx.negotiate_version(peer) else {
        debug!(window, peer, "Ignoring window with unsupported XDND version");
        return Ok(None);
    };

    if !types.is_empty() && !accepted.is_empty() && negotiate_type(types, accepted).is_none() {
        trace!(window, "Window accepts none of the offered types");
        return Ok(None);
    }

    Ok(Some(version))
}

/// Resolve the `XdndProxy` of `window`
///
/// The proxy is only used if it carries an `XdndProxy` property pointing to itself,
/// anything else is a stale leftover and ignored.
pub fn proxy_window<C: DisplayConnection>(
    ctx: &ProtocolContext<C>,
    window: Window,
) -> Result<Option<Window>, ConnectionError> {
    let conn = ctx.connection();
    let property = ctx.atoms().XdndProxy;
    let Some(proxy) = read_property32(conn, window, property, predefined::WINDOW, 1)?
        .and_then(|values| values.first().copied())
    else {
        return Ok(None);
    };

    let verified = match read_property32(conn, proxy, property, predefined::WINDOW, 1) {
        Ok(values) => values.and_then(|values| values.first().copied()) == Some(proxy),
        Err(ConnectionError::BadWindow(_)) => false,
        Err(err) => return Err(err),
    };
    if !verified {
        debug!(window, proxy, "Ignoring unverified XdndProxy");
        return Ok(None);
    }
    Ok(Some(proxy))
}

/// The windows below `from` containing `point`, outermost first
///
/// `point` is given in root coordinates. `from` itself is not part of the result.
pub fn descend<C: DisplayConnection>(
    conn: &C,
    from: Window,
    point: Point,
) -> Result<SmallVec<[Window; 8]>, ConnectionError> {
    let root = conn.root();
    let mut chain = SmallVec::new();
    let mut current = from;
    while let Some((_, child)) = conn.translate_coordinates(root, current, point)? {
        if child == NONE {
            break;
        }
        chain.push(child);
        current = child;
    }
    Ok(chain)
}
