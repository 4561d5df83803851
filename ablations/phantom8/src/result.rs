//! 实验结果.

use crate::algos::Profile;
use std::io::{self, Write};

/// 将 `profile` 的结果写进 `w` 中.
fn describe_into<W: Write>(name: &str, p: &Profile, w: &mut W) -> io::Result<()> {
    const S4: &str = "    ";

    #[inline]
    fn f64_to_display(f: Option<f64>) -> String {
        match f {
            Some(f) => format!("{f:.3}"),
            None => "/".to_string(),
        }
    }

    let s = p.get_tracking_stats();
    writeln!(w, "Profile `{name}`:")?;
    writeln!(w, "{S4}Seeds: {}", s.seeds)?;
    writeln!(
        w,
        "{S4}Accepted / discarded / retries: {} / {} / {}",
        s.accepted, s.discarded, s.retries
    )?;
    if let Some(l) = p.get_lengths() {
        writeln!(
            w,
            "{S4}Length (mm): min {:.2}, median {:.2}, max {:.2}, mean {:.2} ± {:.2}",
            l.min, l.median, l.max, l.mean, l.std
        )?;
    }
    writeln!(w, "{S4}Centroids: {}", p.get_clusters())?;
    writeln!(w, "{S4}Labeled voxels: {}", p.get_labeled())?;
    writeln!(w, "{S4}Tractometry bins: {}", p.get_bins())?;
    writeln!(w, "{S4}Tracking time: {} us", p.get_tracking_time_us())?;
    writeln!(
        w,
        "{S4}Average time per seed: {} us",
        f64_to_display(p.get_avg_seed_time_us())
    )?;
    writeln!(w, "{S4}Analysis time: {} us", p.get_analysis_time_us())?;
    write!(w, "{S4}Total machine time: {} us", p.get_real_time_us())?;
    Ok(())
}

/// 消融实验最终结果.
pub struct AblationResult {
    data: Vec<(&'static str, Profile)>,
}

impl AblationResult {
    pub fn from_iter<I: IntoIterator<Item = (&'static str, Profile)>>(it: I) -> Self {
        Self {
            data: it.into_iter().collect(),
        }
    }

    /// 分析运行结果.
    pub fn analyze(&self) {
        utils::sep();
        let mut buf = Vec::with_capacity(512);

        for (key, profile) in self.data.iter() {
            describe_into(key, profile, &mut buf).unwrap();
            println!("{}", String::from_utf8_lossy(&buf));
            buf.clear();

            utils::sep();
        }
    }
}
