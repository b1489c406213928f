// SPDX-License-Identifier: Apache-2.0

// Backend drivers module

pub mod duckdb;
