// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

mod priority_queue;
mod slot_queue;

pub use priority_queue::{Priority, PriorityQueue};
pub use slot_queue::SlotQueue;
