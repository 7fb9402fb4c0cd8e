// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::process::ExitCode;

use clap::Parser;
use foundry::FoundryApp;

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let app = FoundryApp::parse();
    let log = app.setup_log()?;
    app.exec(&log).await
}
