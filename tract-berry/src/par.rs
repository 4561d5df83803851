//! 并行/串行统一入口. 关闭 `rayon` feature 时退化为顺序执行, 结果相同.

cfg_if::cfg_if! {
    if #[cfg(feature = "rayon")] {
        use rayon::prelude::*;

        /// 对 `0..len` 的每个索引计算 `op`, 结果按索引顺序收集.
        pub(crate) fn map_indexed<T, F>(len: usize, op: F) -> Vec<T>
        where
            T: Send,
            F: Fn(usize) -> T + Sync + Send,
        {
            (0..len).into_par_iter().map(op).collect()
        }

        /// 对切片的每个元素计算 `op`, 结果按原顺序收集.
        pub(crate) fn map_slice<S, T, F>(data: &[S], op: F) -> Vec<T>
        where
            S: Sync,
            T: Send,
            F: Fn(&S) -> T + Sync + Send,
        {
            data.par_iter().map(op).collect()
        }
    } else {
        /// 对 `0..len` 的每个索引计算 `op`, 结果按索引顺序收集.
        pub(crate) fn map_indexed<T, F>(len: usize, op: F) -> Vec<T>
        where
            F: Fn(usize) -> T,
        {
            (0..len).map(op).collect()
        }

        /// 对切片的每个元素计算 `op`, 结果按原顺序收集.
        pub(crate) fn map_slice<S, T, F>(data: &[S], op: F) -> Vec<T>
        where
            F: Fn(&S) -> T,
        {
            data.iter().map(op).collect()
        }
    }
}
