//! bulletin-core: the records every bulletin participant shares.
//!
//! Defines the JSON wire form, key schema, and validation rules for the
//! coordinated objects (tasks, desired and actual LRPs, auctions, cell and
//! auctioneer presences, domain freshness), plus the injectable clock and
//! the `bulletin.toml` configuration.
//!
//! # Key schema
//!
//! ```text
//! /v1/task/<task_guid>
//! /v1/desired/<process_guid>
//! /v1/actual/<process_guid>/<index>
//! /v1/actual/<process_guid>/<index>/evacuating
//! /v1/start_auction/<process_guid>/<index>
//! /v1/stop_auction/<process_guid>
//! /v1/cell/<cell_id>
//! /v1/auctioneer/<auctioneer_id>
//! /v1/freshness/<domain>
//! /v1/lock/<name>
//! ```
//!
//! Every record serializes its fields in declaration order and keeps maps
//! ordered, so the bytes written for a given value are always the same.

pub mod action;
pub mod auction;
pub mod clock;
pub mod config;
pub mod error;
pub mod failure;
pub mod keys;
pub mod lrp;
pub mod presence;
pub mod record;
mod state;
pub mod task;

pub use action::Action;
pub use auction::{AuctionState, LrpStartAuction, LrpStopAuction};
pub use clock::{Clock, FakeClock, SystemClock};
pub use config::BulletinConfig;
pub use error::{FieldError, ModelError, ModelResult, ValidationErrors};
pub use failure::sanitize_failure_reason;
pub use lrp::{
    ActualLrp, ActualLrpContainerKey, ActualLrpKey, ActualLrpNetInfo, ActualLrpState,
    DesiredLrp, DesiredLrpUpdate, PortMapping, StopLrpInstance,
};
pub use presence::{AuctioneerPresence, CellPresence, Freshness};
pub use record::Record;
pub use task::{Task, TaskState};
