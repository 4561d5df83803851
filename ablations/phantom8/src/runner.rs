//! 程序运行函数.

use crate::result::AblationResult;
use std::thread;
use utils::phantom;

/// 体模半圆半径 (体素).
const RADIUS: usize = 8;

/// 实际运行.
pub fn run() -> AblationResult {
    let phantom = phantom::arc_and_line(RADIUS);
    let p = &phantom;

    println!("Running ablation studies on {} cpus...", utils::cpus());
    thread::scope(|s| {
        use super::algos::*;

        let handles = [deterministic, probabilistic, neighbourhood, first_order]
            .map(|t| s.spawn(move || t(p)));

        AblationResult::from_iter(
            ["deterministic", "probabilistic", "neighbourhood", "first_order"]
                .into_iter()
                .zip(
                    handles
                        .into_iter()
                        .map(|th| th.join().expect("Thread joining error")),
                ),
        )
    })
}
