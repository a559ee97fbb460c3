// SPDX-License-Identifier: Apache-2.0
// Copyright 2026 Stasis Contributors

use stasis_core::{Client, Config, JobId, RestoreArgs, StasisResult};

use super::cancel_on_ctrl_c;

pub async fn execute(
    config: Config,
    job: Option<String>,
    path: Option<String>,
) -> StasisResult<()> {
    let client = Client::new(config)?;
    let args = RestoreArgs {
        job_id: job.map(JobId::new).transpose()?,
        checkpoint_path: path,
    };

    let new_pid = client.restore(args, cancel_on_ctrl_c()).await?;
    println!("Restored process with pid {new_pid}");
    Ok(())
}
