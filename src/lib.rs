#![cfg_attr(docsrs, feature(doc_auto_cfg))]
#![warn(missing_docs, missing_debug_implementations, rust_2018_idioms)]

//! # xdnd: drag and drop between X11 clients
//!
//! This crate implements both sides of the XDND protocol: dragging data out of your
//! windows into other applications, and receiving data dropped onto your windows.
//! It does not open windows or draw anything, it only drives the protocol.
//!
//! ## Structure of the crate
//!
//! - [`connection`] abstracts the display server behind the [`DisplayConnection`](connection::DisplayConnection)
//!   trait. An implementation on top of [`x11rb`](https://docs.rs/x11rb) is provided with the
//!   `backend_x11` feature, an in-memory server for tests with the `backend_dummy` feature.
//! - [`xdnd`] contains the protocol itself: the [`DragController`](xdnd::DragController) for the
//!   source side, the [`DropController`](xdnd::DropController) for the target side, and the
//!   [`DndHandler`](xdnd::DndHandler) trait the host implements to take part in a drag.
//! - [`utils`] contains geometry and timestamp helpers, and with the `x11rb_event_source`
//!   feature a [`calloop`] event source for x11rb connections.
//!
//! ## Driving the controllers
//!
//! Both controllers are plain state machines. They never read events themselves, the host
//! passes every relevant event of its connection to `handle_event` and gets an outcome back
//! once a drag or drop ended. This makes them usable from any event loop.
//!
//! ### Logging
//!
//! xdnd makes extensive use of [`tracing`] for its internal logging.
//!
//! For release builds it is recommended to limit the log level during compile time.
//! This can be done by adding a dependency to [`tracing`] and enabling the corresponding features:
//!
//! ```toml
//! [dependencies]
//! tracing = { version = "0.1", features = ["max_level_trace", "release_max_level_debug"] }
//! ```

pub mod connection;
pub mod utils;
pub mod xdnd;
