// Copyright 2022 TiKV Project Authors. Licensed under Apache-2.0.

pub mod client;
pub mod keys;
pub mod store;

pub use client::{LastError, MetadataClient, MetadataEvent, StreamTask, TaskInfo, Watcher};
