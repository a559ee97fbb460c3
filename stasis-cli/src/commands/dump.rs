// SPDX-License-Identifier: Apache-2.0
// Copyright 2026 Stasis Contributors

use std::path::PathBuf;

use stasis_core::{Client, Config, DumpArgs, JobId, Pid, StasisResult};

use super::cancel_on_ctrl_c;

pub async fn execute(
    config: Config,
    pid: i32,
    job: &str,
    dir: Option<PathBuf>,
    gpu: bool,
) -> StasisResult<()> {
    let client = Client::new(config)?;
    let args = DumpArgs {
        pid: Pid::new(pid)?,
        job_id: JobId::new(job)?,
        archive_dir: dir,
        gpu,
    };

    let result = client.dump(args, cancel_on_ctrl_c()).await?;
    println!("Dumped process {pid} to {}", result.checkpoint_path);
    Ok(())
}
