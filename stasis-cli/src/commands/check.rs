// SPDX-License-Identifier: Apache-2.0
// Copyright 2026 Stasis Contributors

use stasis_core::{Client, Config, StasisResult};

pub fn execute(config: Config) -> StasisResult<()> {
    let client = Client::new(config)?;
    let version = client.engine_version()?;
    println!(
        "engine version {}.{}.{} ({})",
        version / 10000,
        (version / 100) % 100,
        version % 100,
        version
    );
    Ok(())
}
