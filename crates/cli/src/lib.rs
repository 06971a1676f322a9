// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Offline tools over a node's data directory.

pub mod commands;
