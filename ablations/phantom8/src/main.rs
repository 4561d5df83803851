//! 在半圆交叉体模上比较不同追踪配置, 并对结果进行聚类, 分区与 tractometry.

mod algos;
mod result;
mod runner;

fn main() {
    simple_logger::SimpleLogger::new()
        .with_level(log::LevelFilter::Info)
        .init()
        .unwrap();
    runner::run().analyze();
}
