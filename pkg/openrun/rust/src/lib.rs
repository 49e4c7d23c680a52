// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Process supervisor and reverse-proxy router for hosted web workloads.

pub mod cli;
pub mod config;
pub mod descriptor;
pub mod env;
pub mod errors;
pub mod events;
pub mod health;
pub mod process;
pub mod proxy;
pub mod restart;
pub mod routes;
pub mod shutdown;
pub mod state;
pub mod supervisor;
