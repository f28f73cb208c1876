// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2024 Hyperpolymath

//! SVG figures for evaluation diagnostics
//!
//! Provides:
//! - Bar charts (test set distribution)
//! - Annotated heat-maps (classification report, confusion matrices)
//! - Image galleries with embedded PNG tiles
//! - Sinks that "show" finished figures

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use image::{ImageFormat, RgbImage};
use std::fmt::Write;
use std::io::Cursor;
use std::path::{Path, PathBuf};

/// Pixels per inch used to turn figure sizes into SVG dimensions
pub const DPI: f64 = 100.0;

/// What a figure shows
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FigureKind {
    Distribution,
    ClassificationReport,
    ConfusionMatrix,
    Gallery,
}

/// The data a figure was drawn from
#[derive(Debug, Clone, PartialEq)]
pub enum FigureData {
    Bars { labels: Vec<String>, values: Vec<usize> },
    Heatmap { values: Vec<Vec<f64>> },
    Gallery { rows: usize, cols: usize },
}

/// A rendered figure
#[derive(Debug, Clone, PartialEq)]
pub struct Figure {
    pub kind: FigureKind,
    pub title: String,
    pub data: FigureData,
    pub svg: String,
}

/// Destination for figures shown in interactive mode
pub trait FigureSink {
    fn show(&mut self, figure: &Figure) -> anyhow::Result<()>;
}

/// Keeps every shown figure in memory
#[derive(Debug, Default)]
pub struct CollectingSink {
    pub figures: Vec<Figure>,
}

impl FigureSink for CollectingSink {
    fn show(&mut self, figure: &Figure) -> anyhow::Result<()> {
        self.figures.push(figure.clone());
        Ok(())
    }
}

/// Writes each shown figure as a numbered SVG file
#[derive(Debug)]
pub struct SvgDirectorySink {
    dir: PathBuf,
    count: usize,
}

impl SvgDirectorySink {
    pub fn new(dir: &Path) -> anyhow::Result<Self> {
        std::fs::create_dir_all(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            count: 0,
        })
    }
}

impl FigureSink for SvgDirectorySink {
    fn show(&mut self, figure: &Figure) -> anyhow::Result<()> {
        self.count += 1;
        let path = self
            .dir
            .join(format!("{:02}_{}.svg", self.count, slug(&figure.title)));
        std::fs::write(&path, &figure.svg)?;
        tracing::info!("Figure written to {}", path.display());
        Ok(())
    }
}

fn slug(title: &str) -> String {
    let s: String = title
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
        .collect();
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if !(c == '_' && out.ends_with('_')) {
            out.push(c);
        }
    }
    out.trim_matches('_').chars().take(60).collect()
}

/// Escape text for use inside SVG elements and attributes
pub fn escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// Font sizes used when laying out a figure
#[derive(Debug, Clone, Copy)]
pub struct Fonts {
    pub title: f64,
    pub label: f64,
    pub ticks: f64,
}

impl From<&crate::config::PlotParams> for Fonts {
    fn from(p: &crate::config::PlotParams) -> Self {
        Self {
            title: p.fontsize_title,
            label: p.fontsize_label,
            ticks: p.fontsize_ticks,
        }
    }
}

const BLUES: [(u8, u8, u8); 9] = [
    (0xf7, 0xfb, 0xff),
    (0xde, 0xeb, 0xf7),
    (0xc6, 0xdb, 0xef),
    (0x9e, 0xca, 0xe1),
    (0x6b, 0xae, 0xd6),
    (0x42, 0x92, 0xc6),
    (0x21, 0x71, 0xb5),
    (0x08, 0x51, 0x9c),
    (0x08, 0x30, 0x6b),
];

fn lerp_palette(palette: &[(u8, u8, u8)], t: f64) -> (u8, u8, u8) {
    let t = if t.is_nan() { 0.0 } else { t.clamp(0.0, 1.0) };
    let pos = t * (palette.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = (lo + 1).min(palette.len() - 1);
    let frac = pos - lo as f64;
    let mix = |a: u8, b: u8| (a as f64 + (b as f64 - a as f64) * frac).round() as u8;
    let (a, b) = (palette[lo], palette[hi]);
    (mix(a.0, b.0), mix(a.1, b.1), mix(a.2, b.2))
}

/// Matplotlib "Blues" colormap
pub fn blues(t: f64) -> (u8, u8, u8) {
    lerp_palette(&BLUES, t)
}

/// Matplotlib "jet" colormap
pub fn jet(t: f64) -> (u8, u8, u8) {
    let t = if t.is_nan() { 0.0 } else { t.clamp(0.0, 1.0) };
    let channel = |offset: f64| {
        let v = 1.5 - (4.0 * t - offset).abs();
        (v.clamp(0.0, 1.0) * 255.0).round() as u8
    };
    (channel(3.0), channel(2.0), channel(1.0))
}

/// Annotation color: white above half of the matrix maximum
pub fn annotation_color(value: f64, threshold: f64) -> &'static str {
    if value > threshold {
        "white"
    } else {
        "black"
    }
}

fn svg_open(svg: &mut String, width: f64, height: f64) {
    let _ = writeln!(
        svg,
        r#"<svg xmlns="http://www.w3.org/2000/svg" width="{w:.0}" height="{h:.0}" viewBox="0 0 {w:.0} {h:.0}" font-family="sans-serif">"#,
        w = width,
        h = height
    );
    let _ = writeln!(svg, r#"  <rect width="100%" height="100%" fill="white"/>"#);
}

fn text(svg: &mut String, x: f64, y: f64, size: f64, anchor: &str, extra: &str, content: &str) {
    let _ = writeln!(
        svg,
        r#"  <text x="{x:.1}" y="{y:.1}" font-size="{size:.0}" text-anchor="{anchor}"{extra}>{}</text>"#,
        escape(content)
    );
}

/// Bar chart of integer counts, one bar per label
pub fn bar_chart(
    title: &str,
    xlabel: &str,
    ylabel: &str,
    labels: &[String],
    values: &[usize],
    figsize: (f64, f64),
    fonts: Fonts,
) -> Figure {
    let (width, height) = (figsize.0 * DPI, figsize.1 * DPI);
    let (left, right, top, bottom) = (70.0, 20.0, 50.0, 110.0);
    let plot_w = width - left - right;
    let plot_h = height - top - bottom;
    let max = values.iter().copied().max().unwrap_or(0).max(1) as f64;
    let slot = plot_w / labels.len().max(1) as f64;

    let mut svg = String::new();
    svg_open(&mut svg, width, height);
    text(&mut svg, width / 2.0, 30.0, fonts.title, "middle", "", title);

    let _ = writeln!(
        svg,
        r##"  <line x1="{left}" y1="{y:.1}" x2="{x2:.1}" y2="{y:.1}" stroke="#555"/>"##,
        y = top + plot_h,
        x2 = left + plot_w
    );

    for (i, (label, &value)) in labels.iter().zip(values).enumerate() {
        let bar_h = value as f64 / max * plot_h;
        let x = left + i as f64 * slot + slot * 0.1;
        let y = top + plot_h - bar_h;
        let _ = writeln!(
            svg,
            r##"  <rect x="{x:.1}" y="{y:.1}" width="{w:.1}" height="{bar_h:.1}" fill="#e24a33"><title>{}: {value}</title></rect>"##,
            escape(label),
            w = slot * 0.8
        );
        let cx = left + (i as f64 + 0.5) * slot;
        let ty = top + plot_h + 15.0;
        text(
            &mut svg,
            cx,
            ty,
            fonts.ticks,
            "end",
            &format!(r#" transform="rotate(-30 {cx:.1} {ty:.1})""#),
            label,
        );
    }

    text(&mut svg, left + plot_w / 2.0, height - 10.0, fonts.label, "middle", "", xlabel);
    let (yx, yy) = (18.0, top + plot_h / 2.0);
    text(
        &mut svg,
        yx,
        yy,
        fonts.label,
        "middle",
        &format!(r#" transform="rotate(-90 {yx} {yy:.1})""#),
        ylabel,
    );
    svg.push_str("</svg>\n");

    Figure {
        kind: FigureKind::Distribution,
        title: title.to_string(),
        data: FigureData::Bars {
            labels: labels.to_vec(),
            values: values.to_vec(),
        },
        svg,
    }
}

/// Input of an annotated heat-map
#[derive(Debug, Clone)]
pub struct Heatmap<'a> {
    pub kind: FigureKind,
    pub title: &'a str,
    pub xlabel: &'a str,
    pub ylabel: &'a str,
    pub x_labels: &'a [String],
    pub y_labels: &'a [String],
    pub values: &'a [Vec<f64>],
    pub figsize: (f64, f64),
}

impl Heatmap<'_> {
    /// Render with a Blues colormap over `[0, 1]` and per-cell annotations
    pub fn render(&self, fonts: Fonts) -> Figure {
        let (width, height) = (self.figsize.0 * DPI, self.figsize.1 * DPI);
        let (left, right, top, bottom) = (130.0, 70.0, 50.0, 110.0);
        let n_rows = self.values.len().max(1);
        let n_cols = self.values.iter().map(Vec::len).max().unwrap_or(0).max(1);
        let cell_w = (width - left - right) / n_cols as f64;
        let cell_h = (height - top - bottom) / n_rows as f64;

        let max = self
            .values
            .iter()
            .flatten()
            .copied()
            .fold(f64::NEG_INFINITY, f64::max);
        let threshold = if max.is_finite() { max / 2.0 } else { 0.0 };

        let mut svg = String::new();
        svg_open(&mut svg, width, height);
        text(&mut svg, width / 2.0, 30.0, fonts.title, "middle", "", self.title);

        for (i, row) in self.values.iter().enumerate() {
            for (j, &v) in row.iter().enumerate() {
                let (r, g, b) = blues(v);
                let x = left + j as f64 * cell_w;
                let y = top + i as f64 * cell_h;
                let _ = writeln!(
                    svg,
                    r#"  <rect x="{x:.1}" y="{y:.1}" width="{cell_w:.1}" height="{cell_h:.1}" fill="rgb({r},{g},{b})"/>"#
                );
                text(
                    &mut svg,
                    x + cell_w / 2.0,
                    y + cell_h / 2.0 + fonts.ticks / 3.0,
                    fonts.ticks,
                    "middle",
                    &format!(r#" fill="{}""#, annotation_color(v, threshold)),
                    &format!("{v:.2}"),
                );
            }
        }

        for (j, label) in self.x_labels.iter().enumerate() {
            let cx = left + (j as f64 + 0.5) * cell_w;
            let ty = top + n_rows as f64 * cell_h + 15.0;
            text(
                &mut svg,
                cx,
                ty,
                fonts.ticks,
                "end",
                &format!(r#" transform="rotate(-45 {cx:.1} {ty:.1})""#),
                label,
            );
        }
        for (i, label) in self.y_labels.iter().enumerate() {
            let cy = top + (i as f64 + 0.5) * cell_h + fonts.ticks / 3.0;
            text(&mut svg, left - 6.0, cy, fonts.ticks, "end", "", label);
        }

        // colorbar
        let bar_x = width - right + 20.0;
        let bar_h = n_rows as f64 * cell_h;
        for k in 0..50 {
            let t = 1.0 - k as f64 / 49.0;
            let (r, g, b) = blues(t);
            let _ = writeln!(
                svg,
                r#"  <rect x="{bar_x:.1}" y="{y:.1}" width="15" height="{h:.2}" fill="rgb({r},{g},{b})"/>"#,
                y = top + k as f64 * bar_h / 50.0,
                h = bar_h / 50.0 + 0.5
            );
        }

        text(
            &mut svg,
            left + (width - left - right) / 2.0,
            height - 10.0,
            fonts.label,
            "middle",
            "",
            self.xlabel,
        );
        let (yx, yy) = (18.0, top + bar_h / 2.0);
        text(
            &mut svg,
            yx,
            yy,
            fonts.label,
            "middle",
            &format!(r#" transform="rotate(-90 {yx} {yy:.1})""#),
            self.ylabel,
        );
        svg.push_str("</svg>\n");

        Figure {
            kind: self.kind,
            title: self.title.to_string(),
            data: FigureData::Heatmap {
                values: self.values.to_vec(),
            },
            svg,
        }
    }
}

/// One cell of a gallery grid
#[derive(Debug, Clone)]
pub struct Tile {
    pub caption: Option<String>,
    pub image: RgbImage,
}

/// Encode an image as a `data:` URI for embedding
pub fn png_data_uri(img: &RgbImage) -> Result<String, image::ImageError> {
    let mut buf = Cursor::new(Vec::new());
    img.write_to(&mut buf, ImageFormat::Png)?;
    Ok(format!("data:image/png;base64,{}", BASE64.encode(buf.into_inner())))
}

/// Grid of images, one row per entry of `rows`
pub fn gallery(title: &str, rows: &[Vec<Tile>], fonts: Fonts) -> Result<Figure, image::ImageError> {
    let n_rows = rows.len();
    let n_cols = rows.iter().map(Vec::len).max().unwrap_or(0);
    let (tile_w, tile_h) = (5.0 * DPI, 4.0 * DPI);
    let (width, height) = (n_cols as f64 * tile_w, n_rows as f64 * tile_h + 50.0);

    let mut svg = String::new();
    svg_open(&mut svg, width, height);
    text(&mut svg, width / 2.0, 30.0, fonts.title, "middle", "", title);

    for (i, row) in rows.iter().enumerate() {
        for (j, tile) in row.iter().enumerate() {
            let x = j as f64 * tile_w;
            let y = 50.0 + i as f64 * tile_h;
            let side = tile_h - 50.0;
            let _ = writeln!(
                svg,
                r#"  <image x="{ix:.1}" y="{iy:.1}" width="{side:.1}" height="{side:.1}" href="{}"/>"#,
                png_data_uri(&tile.image)?,
                ix = x + (tile_w - side) / 2.0,
                iy = y + 30.0
            );
            if let Some(caption) = &tile.caption {
                text(&mut svg, x + tile_w / 2.0, y + 20.0, 12.0, "middle", "", caption);
            }
        }
    }
    svg.push_str("</svg>\n");

    Ok(Figure {
        kind: FigureKind::Gallery,
        title: title.to_string(),
        data: FigureData::Gallery {
            rows: n_rows,
            cols: n_cols,
        },
        svg,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fonts() -> Fonts {
        Fonts {
            title: 16.0,
            label: 12.0,
            ticks: 9.0,
        }
    }

    #[test]
    fn test_annotation_threshold() {
        assert_eq!(annotation_color(0.6, 0.5), "white");
        assert_eq!(annotation_color(0.5, 0.5), "black");
        assert_eq!(annotation_color(0.1, 0.5), "black");
    }

    #[test]
    fn test_colormaps_endpoints() {
        assert_eq!(blues(0.0), (0xf7, 0xfb, 0xff));
        assert_eq!(blues(1.0), (0x08, 0x30, 0x6b));
        assert_eq!(blues(2.0), blues(1.0));
        assert_eq!(jet(0.0), (0, 0, 128));
        assert_eq!(jet(1.0), (128, 0, 0));
    }

    #[test]
    fn test_bar_chart_svg() {
        let labels = vec!["cat".to_string(), "<dog>".to_string()];
        let fig = bar_chart("Counts", "Label", "Number", &labels, &[3, 5], (8.0, 5.0), fonts());

        assert!(fig.svg.starts_with("<svg"));
        assert!(fig.svg.contains("&lt;dog&gt;"));
        assert_eq!(fig.svg.matches("<rect x=").count(), 2);
        assert_eq!(
            fig.data,
            FigureData::Bars {
                labels,
                values: vec![3, 5]
            }
        );
    }

    #[test]
    fn test_heatmap_annotations() {
        let names = vec!["a".to_string(), "b".to_string()];
        let values = vec![vec![0.9, 0.1], vec![0.3, 0.7]];
        let fig = Heatmap {
            kind: FigureKind::ConfusionMatrix,
            title: "cm",
            xlabel: "Predicted label",
            ylabel: "True label",
            x_labels: &names,
            y_labels: &names,
            values: &values,
            figsize: (9.0, 8.0),
        }
        .render(fonts());

        assert!(fig.svg.contains(">0.90</text>"));
        assert_eq!(fig.svg.matches(r#"fill="white">"#).count(), 2);
        assert_eq!(fig.svg.matches(r#"fill="black">"#).count(), 2);
    }

    #[test]
    fn test_gallery_embeds_png() {
        let tile = Tile {
            caption: Some("true: a, predicted: b (0.5)".to_string()),
            image: RgbImage::from_pixel(4, 4, image::Rgb([1, 2, 3])),
        };
        let fig = gallery("g", &[vec![tile.clone(), tile]], fonts()).unwrap();

        assert_eq!(fig.data, FigureData::Gallery { rows: 1, cols: 2 });
        assert_eq!(fig.svg.matches("data:image/png;base64,").count(), 2);
    }

    #[test]
    fn test_svg_directory_sink() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = SvgDirectorySink::new(dir.path()).unwrap();
        let fig = bar_chart("Number of images: 3", "x", "y", &[], &[], (8.0, 5.0), fonts());
        sink.show(&fig).unwrap();

        assert!(dir.path().join("01_number_of_images_3.svg").is_file());
    }
}
