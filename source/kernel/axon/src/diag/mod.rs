// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Diagnostics: logging, liveness, monitor listings
//! OWNERS: @kernel-team
//! PUBLIC API: log, liveness, fmt_envs()
//! DEPENDS_ON: axon_abi::EnvInfo
//! INVARIANTS: Formatting helpers never take the kernel lock themselves

#[macro_use]
pub mod log;
pub mod liveness;

use core::fmt::{self, Write};

use axon_abi::{EnvInfo, EnvStatus, EnvType};

const fn status_tag(status: EnvStatus) -> &'static str {
    match status {
        EnvStatus::Free => "free",
        EnvStatus::Dying => "dying",
        EnvStatus::Runnable => "runnable",
        EnvStatus::Running => "running",
        EnvStatus::NotRunnable => "blocked",
    }
}

const fn type_tag(ty: EnvType) -> &'static str {
    match ty {
        EnvType::User => "user",
        EnvType::Idle => "idle",
        EnvType::FileServer => "fs",
        EnvType::NetServer => "ns",
    }
}

/// Writes the monitor's environment listing, one live environment per line.
pub fn fmt_envs<W: Write>(envs: &[EnvInfo], f: &mut W) -> fmt::Result {
    writeln!(f, "id       parent   type status    runs  ipc")?;
    for env in envs {
        write!(
            f,
            "{} {} {:<4} {:<9} {:>5}",
            env.id,
            env.parent,
            type_tag(env.env_type),
            status_tag(env.status),
            env.runs
        )?;
        if env.ipc_recving {
            write!(f, "  recv")?;
        }
        writeln!(f)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::String;
    use axon_abi::{EnvId, PageFlags};

    #[test]
    fn env_listing_marks_receivers() {
        let info = EnvInfo {
            id: EnvId::from_parts(2, 1),
            parent: EnvId::SELF,
            env_type: EnvType::User,
            status: EnvStatus::NotRunnable,
            runs: 4,
            ipc_recving: true,
            ipc_from: EnvId::SELF,
            ipc_value: 0,
            ipc_perm: PageFlags::empty(),
        };
        let mut out = String::new();
        fmt_envs(&[info], &mut out).unwrap();
        let line = out.lines().nth(1).unwrap();
        assert!(line.starts_with("00000402 00000000 user blocked"));
        assert!(line.ends_with("recv"));
    }
}
