// Copyright (c) 2025 - Cowboy AI, Inc.
//! Property-Based Tests Module
//!
//! Properties of the event codec and topic routing that must hold for every
//! input, not just the fixtures.

mod envelope_codec;
mod topic_routing;
