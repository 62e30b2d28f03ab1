//! Text and Markdown rendering of lane FFT results.

use super::params::{FftJobResult, JobParams};
use super::profiling::ProfilingReport;
use crate::error::Result;
use std::fmt::Write as _;
use std::fs;
use std::path::Path;

/// `12.5 MHz`, `3.25 kHz`, `40.00 Hz`.
pub fn format_frequency(hz: f32) -> String {
    let a = hz.abs();
    if a >= 1.0e6 {
        format!("{:.3} MHz", hz / 1.0e6)
    } else if a >= 1.0e3 {
        format!("{:.3} kHz", hz / 1.0e3)
    } else {
        format!("{hz:.2} Hz")
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PrintOptions {
    pub parameters: bool,
    pub profiling: bool,
    pub peaks: bool,
    /// Lanes printed before the listing is cut short; 0 prints every lane.
    pub max_lanes: usize,
}

impl PrintOptions {
    pub fn all() -> Self {
        Self { parameters: true, profiling: true, peaks: true, max_lanes: 0 }
    }

    pub fn minimal() -> Self {
        Self { parameters: false, profiling: false, peaks: true, max_lanes: 8 }
    }

    pub fn none() -> Self {
        Self { parameters: false, profiling: false, peaks: false, max_lanes: 0 }
    }
}

impl Default for PrintOptions {
    fn default() -> Self {
        Self::all()
    }
}

pub struct ResultPrinter {
    options: PrintOptions,
}

impl ResultPrinter {
    pub fn new(options: PrintOptions) -> Self {
        Self { options }
    }

    pub fn render(
        &self,
        params: &JobParams,
        result: &FftJobResult,
        profile: Option<&ProfilingReport>,
    ) -> String {
        let mut out = String::new();
        let o = &self.options;
        if o.parameters {
            let _ = writeln!(out, "=== Lane FFT {} {} ===", result.task_id, result.module_name);
            let _ = writeln!(out, "lanes          : {}", params.lane_count);
            let _ = writeln!(out, "samples/lane   : {}", params.samples_per_lane);
            let _ = writeln!(out, "transform size : {}", result.transform_size);
            let _ = writeln!(out, "search window  : {}", params.search_window);
            let _ = writeln!(out, "peaks          : {}", params.peak_count);
            let _ = writeln!(out, "sample rate    : {}", format_frequency(params.sample_rate_hz));
        }
        if o.profiling {
            if let Some(p) = profile {
                let _ = writeln!(out, "{p}");
            }
        }
        if o.peaks {
            let total = result.lanes.len();
            let shown = if o.max_lanes == 0 { total } else { o.max_lanes.min(total) };
            for lane in &result.lanes[..shown] {
                let _ = writeln!(
                    out,
                    "lane {:>4}: refined {} (offset {:+.4})",
                    lane.lane,
                    format_frequency(lane.refined_frequency_hz),
                    lane.sub_bin_offset
                );
                for (k, peak) in lane.peaks.iter().enumerate() {
                    let _ = writeln!(
                        out,
                        "    #{k} bin {:>6}  |X| {:>12.4}  phase {:>8.2} deg  ({:+.4}, {:+.4})",
                        peak.bin_index, peak.magnitude, peak.phase_degrees, peak.real, peak.imag
                    );
                }
            }
            if shown < result.lanes.len() {
                let _ = writeln!(out, "... {} more lanes", result.lanes.len() - shown);
            }
        }
        out
    }

    pub fn print(
        &self,
        params: &JobParams,
        result: &FftJobResult,
        profile: Option<&ProfilingReport>,
    ) {
        print!("{}", self.render(params, result, profile));
    }
}

/// Markdown table of every lane's peaks followed by the full result as JSON.
pub fn render_markdown(result: &FftJobResult, profile: Option<&ProfilingReport>) -> Result<String> {
    let mut out = String::new();
    let _ = writeln!(out, "# Lane FFT results");
    let _ = writeln!(out);
    let _ = writeln!(out, "- task: `{}`", result.task_id);
    let _ = writeln!(out, "- module: `{}`", result.module_name);
    let _ = writeln!(out, "- lanes: {}", result.lane_count);
    let _ = writeln!(out, "- transform size: {}", result.transform_size);
    if let Some(p) = profile {
        let _ = writeln!(out, "- total time: {:.3} ms", p.total_ms);
    }
    let _ = writeln!(out);
    let _ = writeln!(
        out,
        "| lane | peak | bin | magnitude | phase (deg) | offset | refined frequency |"
    );
    let _ = writeln!(
        out,
        "|-----:|-----:|----:|----------:|------------:|-------:|------------------:|"
    );
    for lane in &result.lanes {
        for (k, p) in lane.peaks.iter().enumerate() {
            let _ = writeln!(
                out,
                "| {} | {} | {} | {:.4} | {:.2} | {:+.4} | {} |",
                lane.lane,
                k,
                p.bin_index,
                p.magnitude,
                p.phase_degrees,
                p.sub_bin_offset,
                format_frequency(p.refined_frequency_hz)
            );
        }
    }
    let _ = writeln!(out);
    let _ = writeln!(out, "```json");
    let _ = writeln!(out, "{}", serde_json::to_string_pretty(result)?);
    let _ = writeln!(out, "```");
    Ok(out)
}

pub fn save_markdown(
    result: &FftJobResult,
    profile: Option<&ProfilingReport>,
    path: impl AsRef<Path>,
) -> Result<()> {
    let text = render_markdown(result, profile)?;
    if let Some(dir) = path.as_ref().parent() {
        if !dir.as_os_str().is_empty() {
            fs::create_dir_all(dir)?;
        }
    }
    fs::write(path, text)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fft::params::{LaneResult, PeakResult};

    fn sample() -> (JobParams, FftJobResult) {
        let params = JobParams::new(2, 8, 8, 3).with_task("task-7", "beamformer");
        let peak = PeakResult {
            bin_index: 3,
            magnitude: 8.0,
            refined_frequency_hz: 2.25e6,
            ..Default::default()
        };
        let lanes = (0..2)
            .map(|lane| LaneResult {
                lane,
                transform_size: 16,
                peaks: vec![peak],
                ..Default::default()
            })
            .collect();
        let result = FftJobResult {
            lanes,
            task_id: "task-7".into(),
            module_name: "beamformer".into(),
            transform_size: 16,
            lane_count: 2,
        };
        (params, result)
    }

    #[test]
    fn frequency_units() {
        assert_eq!(format_frequency(12.0e6), "12.000 MHz");
        assert_eq!(format_frequency(1500.0), "1.500 kHz");
        assert_eq!(format_frequency(40.0), "40.00 Hz");
        assert_eq!(format_frequency(-2.5e3), "-2.500 kHz");
    }

    #[test]
    fn printer_respects_options() {
        let (params, result) = sample();
        let full = ResultPrinter::new(PrintOptions::all()).render(&params, &result, None);
        assert!(full.contains("transform size : 16"));
        assert!(full.contains("lane    1"));
        assert!(ResultPrinter::new(PrintOptions::none()).render(&params, &result, None).is_empty());
        let cut = ResultPrinter::new(PrintOptions { max_lanes: 1, ..PrintOptions::minimal() })
            .render(&params, &result, None);
        assert!(cut.contains("1 more lanes"));
        assert!(!cut.contains("transform size"));
    }

    #[test]
    fn markdown_round_trips_json() {
        let (_, result) = sample();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reports").join("fft.md");
        save_markdown(&result, None, &path).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("| 1 | 0 | 3 |"));
        let json = text.split("```json\n").nth(1).and_then(|s| s.split("```").next()).unwrap();
        let back: FftJobResult = serde_json::from_str(json).unwrap();
        assert_eq!(back, result);
    }
}
