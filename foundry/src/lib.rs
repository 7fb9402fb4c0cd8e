// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The `foundry` command-line tool: brings a cluster deployment through
//! its phases, reports on it, and tears it back down.

mod dispatch;
mod output;

pub use dispatch::FoundryApp;
