// SPDX-License-Identifier: Apache-2.0
// Copyright 2026 Stasis Contributors

use stasis_core::{Client, Config, JobId, StasisResult};

pub fn execute(config: Config, job: &str) -> StasisResult<()> {
    let client = Client::new(config)?;
    let job_id = JobId::new(job)?;

    let latest = client.db().latest_state(&job_id)?;
    println!("job {job_id}: latest pid {}", latest.pid);
    for checkpoint in client.db().list_checkpoints(&job_id)? {
        println!("  {checkpoint}");
    }
    Ok(())
}
