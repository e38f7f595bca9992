//! Ingressgate - control plane for dynamically configured reverse proxies
//!
//! This library turns cluster ingress state into proxy configuration:
//! - Follows ingresses, services and endpoints through list-then-watch informers
//! - Schedules reconciliation on a deduplicating, rate limited work queue
//! - Converts the cached state into routes and clusters
//! - Streams every configuration snapshot to subscribed proxies, replaying
//!   the latest one to proxies that connect later
//! - Provides the receiver loop proxies use to follow that stream

pub mod cache;
pub mod config;
pub mod controller;
pub mod convert;
pub mod dispatch;
pub mod error;
pub mod informer;
pub mod rate;
pub mod receiver;
pub mod reconciler;
pub mod resources;
pub mod snapshot;
pub mod source;
pub mod workqueue;
