// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

pub mod cache;
pub mod region;

pub use cache::{Cache, Filled};
pub use region::Region;
