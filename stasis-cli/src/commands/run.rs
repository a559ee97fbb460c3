// SPDX-License-Identifier: Apache-2.0
// Copyright 2026 Stasis Contributors

use stasis_core::{Client, Config, StasisResult};

pub fn execute(config: Config, task: &str) -> StasisResult<()> {
    let client = Client::new(config)?;
    let pid = client.run_task(task)?;
    println!("Started task with pid {pid}");
    Ok(())
}
