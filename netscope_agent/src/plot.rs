//! Chart artifact for a session's bandwidth history.

use std::fmt::Write as _;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::types::HistoryPoint;

pub trait PlotRenderer: Send + Sync {
    /// Render `history` into `dir`, returning the artifact path.
    fn render(&self, history: &[HistoryPoint], title: &str, dir: &Path) -> io::Result<PathBuf>;
}

/// Dependency-free SVG line chart: download in magenta, upload in lime on a
/// dark background.
pub struct SvgPlotRenderer {
    pub width: u32,
    pub height: u32,
    pub file_name: String,
}

impl Default for SvgPlotRenderer {
    fn default() -> Self {
        Self {
            width: 1000,
            height: 500,
            file_name: "chart.svg".to_string(),
        }
    }
}

const MARGIN: f64 = 50.0;

fn escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

impl SvgPlotRenderer {
    pub fn to_svg(&self, history: &[HistoryPoint], title: &str) -> String {
        let (w, h) = (f64::from(self.width), f64::from(self.height));
        let plot_w = w - 2.0 * MARGIN;
        let plot_h = h - 2.0 * MARGIN;

        let t0 = history.first().map(|p| p.elapsed_seconds).unwrap_or(0.0);
        let t1 = history.last().map(|p| p.elapsed_seconds).unwrap_or(0.0);
        let span = (t1 - t0).max(1e-9);
        let peak = history
            .iter()
            .map(|p| p.download_mbps.max(p.upload_mbps))
            .fold(0.0_f64, f64::max)
            .max(1e-9);

        let line = |pick: fn(&HistoryPoint) -> f64| {
            let mut pts = String::new();
            for p in history {
                let x = MARGIN + (p.elapsed_seconds - t0) / span * plot_w;
                let y = MARGIN + plot_h - pick(p) / peak * plot_h;
                let _ = write!(pts, "{x:.1},{y:.1} ");
            }
            pts
        };

        let mut svg = String::new();
        let _ = writeln!(
            svg,
            r##"<svg xmlns="http://www.w3.org/2000/svg" width="{}" height="{}" viewBox="0 0 {} {}">"##,
            self.width, self.height, self.width, self.height
        );
        let _ = writeln!(svg, r##"<rect width="100%" height="100%" fill="#23272e"/>"##);
        let _ = writeln!(
            svg,
            r##"<text x="{}" y="30" fill="white" font-family="sans-serif" font-size="16" text-anchor="middle">{}</text>"##,
            w / 2.0,
            escape(title)
        );
        let _ = writeln!(
            svg,
            r##"<rect x="{MARGIN}" y="{MARGIN}" width="{plot_w}" height="{plot_h}" fill="none" stroke="white" stroke-opacity="0.3"/>"##
        );
        let _ = writeln!(
            svg,
            r##"<text x="{MARGIN}" y="{}" fill="white" font-family="sans-serif" font-size="12">{peak:.2} Mbps</text>"##,
            MARGIN - 6.0
        );
        let _ = writeln!(
            svg,
            r##"<text x="{}" y="{}" fill="white" font-family="sans-serif" font-size="12" text-anchor="end">{t1:.0} s</text>"##,
            w - MARGIN,
            h - MARGIN + 18.0
        );
        if !history.is_empty() {
            let _ = writeln!(
                svg,
                r##"<polyline fill="none" stroke="magenta" stroke-width="2" points="{}"/>"##,
                line(|p| p.download_mbps).trim_end()
            );
            let _ = writeln!(
                svg,
                r##"<polyline fill="none" stroke="lime" stroke-width="2" points="{}"/>"##,
                line(|p| p.upload_mbps).trim_end()
            );
        }
        let _ = writeln!(
            svg,
            r##"<text x="{}" y="{}" fill="magenta" font-family="sans-serif" font-size="12">Download (Mbps)</text>"##,
            MARGIN,
            h - 15.0
        );
        let _ = writeln!(
            svg,
            r##"<text x="{}" y="{}" fill="lime" font-family="sans-serif" font-size="12">Upload (Mbps)</text>"##,
            MARGIN + 140.0,
            h - 15.0
        );
        svg.push_str("</svg>\n");
        svg
    }
}

impl PlotRenderer for SvgPlotRenderer {
    fn render(&self, history: &[HistoryPoint], title: &str, dir: &Path) -> io::Result<PathBuf> {
        let path = dir.join(&self.file_name);
        fs::write(&path, self.to_svg(history, title))?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hp(t: f64, d: f64, u: f64) -> HistoryPoint {
        HistoryPoint {
            elapsed_seconds: t,
            download_mbps: d,
            upload_mbps: u,
        }
    }

    #[test]
    fn svg_has_both_series_and_escaped_title() {
        let r = SvgPlotRenderer::default();
        let svg = r.to_svg(&[hp(0.0, 1.0, 0.5), hp(1.0, 2.0, 1.0)], "Cafe <5G>");
        assert_eq!(svg.matches("<polyline").count(), 2);
        assert!(svg.contains("Cafe &lt;5G&gt;"));
        assert!(svg.ends_with("</svg>\n"));
    }

    #[test]
    fn empty_history_still_renders() {
        let dir = tempfile::tempdir().unwrap();
        let path = SvgPlotRenderer::default()
            .render(&[], "empty", dir.path())
            .unwrap();
        let svg = fs::read_to_string(path).unwrap();
        assert!(!svg.contains("<polyline"));
    }
}
