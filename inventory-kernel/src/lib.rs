//! Cloud inventory mirror.
//!
//! Keeps a local, queryable copy of the resources of one or more OpenStack
//! deployments: projects, images, flavors, host aggregates, hypervisors and
//! instances. Each kind is polled on its own cadence and reconciled into an
//! embedded store, one namespace per deployment.

pub mod addresses;
pub mod config;
pub mod health;
pub mod http;
pub mod models;
pub mod openstack;
pub mod query;
pub mod reconcile;
pub mod scheduler;
pub mod store;
pub mod tasks;
