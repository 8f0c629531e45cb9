//! Pipeline CRM: board, stage moves, change feed and payment reconciliation.
//!
//! ## Module Map
//!
//! ```text
//! ┌──────────────┐   HTTP   ┌──────────────────────────────────────────────┐
//! │ BoardControl │ ───────> │  server.rs  (axum Router, TraceLayer)        │
//! │ (board.rs)   │ <─────── │    ├─ api.rs  (route handlers, AppState)     │
//! │  via client  │ WebSocket│    └─ ws.rs   (pipeline-updates-{tenant})    │
//! └──────────────┘          │         │                                    │
//!                           │         v                                    │
//!                           │  service.rs  (CrmService: stage moves,       │
//!                           │               intake, stages, tags, board)   │
//!                           │         │ publish LeadInserted               │
//!                           │         v                                    │
//!                           │  feed.rs     (ChangeFeed, FeedListener)      │
//!                           │                                              │
//!                           │  webhook.rs  (WebhookReconciler)             │
//!                           │         │ notify.rs (Notifier)               │
//!                           │         v                                    │
//!                           │  db.rs       (CrmDb behind DbHandle)         │
//!                           └──────────────────────────────────────────────┘
//! ```
//!
//! ## Supporting Modules
//!
//! | Module   | Responsibility                                             |
//! |----------|------------------------------------------------------------|
//! | `models` | Shared types: `Lead`, `Stage`, `BoardProjection`, ...      |
//! | `board`  | Pure drag reducer, `UndoToken`, `BoardController`          |
//! | `client` | `HttpBoardBackend` for controllers outside the server      |
//!
//! ## Stage-Move flow
//!
//! 1. A drag-end reaches `BoardController::begin`, which paints the move and
//!    keeps an `UndoToken`.
//! 2. The command goes to `POST /api/leads/{id}/move` (or straight to
//!    `CrmService` in process).
//! 3. The service checks that lead and stage belong to the tenant and updates
//!    the lead in one transaction.
//! 4. On `{success: true}` the controller refreshes its projection; on
//!    failure or timeout it applies the undo token.

pub mod api;
pub mod board;
pub mod client;
pub mod db;
pub mod feed;
pub mod models;
pub mod notify;
pub mod server;
pub mod service;
pub mod webhook;
pub mod ws;
