// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Binary entrypoint: boot an emulated session from `kaccess.toml` and exercise every primitive.

use std::error::Error;
use std::process::ExitCode;

use kaccess::host::Session;
use kaccess::{Config, LwpId, RtPrioType, SchedulingClass};

fn run() -> Result<(), Box<dyn Error>> {
    let config = Config::load()?;
    let mut session = Session::start(&config)?;
    let base = session.accessor().kernel_base();

    session.accessor().write8(base, 0x4b41_4343_4553_5321)?;
    let back = session.accessor().read8(base)?;
    log::info!("selftest: read8({base}) = {back:#018x}");
    if back != 0x4b41_4343_4553_5321 {
        return Err(format!("read8 returned {back:#018x}").into());
    }

    let banner = b"kaccess";
    let target = base.offset(64).ok_or("image too small")?;
    session.accessor().copy_in(banner, target)?;
    let mut echoed = [0u8; 7];
    session.accessor().copy_out(target, &mut echoed)?;
    if &echoed != banner {
        return Err("copy_out did not return the copied-in bytes".into());
    }

    let rtp = RtPrioType::new(SchedulingClass::Idle, 5);
    session.rtprio().set_rt_prio(LwpId::CURRENT, rtp)?;
    let seen = session.rtprio().lookup_rt_prio(LwpId::CURRENT)?;
    log::info!("selftest: rtprio {seen}");
    if seen != rtp {
        return Err(format!("rtprio lookup returned {seen}").into());
    }

    session.shutdown()?;
    Ok(())
}

fn main() -> ExitCode {
    env_logger::init();
    match run() {
        Ok(()) => {
            println!("kaccess-selftest: ok");
            ExitCode::SUCCESS
        }
        Err(err) => {
            eprintln!("kaccess-selftest: {err}");
            ExitCode::FAILURE
        }
    }
}
