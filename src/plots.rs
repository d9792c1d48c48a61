//! SVG figures drawn with plotters.

use std::error::Error;
use std::fs;
use std::ops::Range;
use std::path::Path;

use plotters::coord::Shift;
use plotters::prelude::*;
use plotters::style::text_anchor::{HPos, Pos, VPos};

use crate::eda::LabeledMatrix;
use crate::error::{Result, StrokeError};
use crate::metrics::Evaluation;
use crate::records::display_name;
use crate::stats::{gaussian_kde, linspace, min_max};

type DrawResult<T = ()> = std::result::Result<T, Box<dyn Error>>;
type Area<'a> = DrawingArea<SVGBackend<'a>, Shift>;

const FONT: &str = "sans-serif";
const HISTOGRAM_BINS: usize = 30;
const KDE_POINTS: usize = 200;

pub const STROKE_COLOR: RGBColor = RGBColor(214, 39, 40);
pub const NO_STROKE_COLOR: RGBColor = RGBColor(31, 119, 180);
const BAR_COLOR: RGBColor = RGBColor(76, 114, 176);
const REFERENCE_COLOR: RGBColor = RGBColor(150, 150, 150);

fn prepare(path: &Path) -> Result<()> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => {
            fs::create_dir_all(parent).map_err(|e| StrokeError::io(parent, e))
        }
        _ => Ok(()),
    }
}

fn finish(path: &Path, result: DrawResult) -> Result<()> {
    result.map_err(|e| StrokeError::Plot {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}

fn grid_shape(panels: usize, columns: usize) -> (usize, usize) {
    let columns = columns.clamp(1, panels.max(1));
    let rows = (panels + columns - 1) / columns;
    (rows.max(1), columns)
}

/// Padded axis range covering every finite value.
fn axis_range(values: impl Iterator<Item = f64>) -> Range<f64> {
    let finite: Vec<f64> = values.filter(|v| v.is_finite()).collect();
    match min_max(&finite) {
        Some((lo, hi)) if hi > lo => {
            let pad = (hi - lo) * 0.05;
            (lo - pad)..(hi + pad)
        }
        Some((v, _)) => (v - 1.0)..(v + 1.0),
        None => 0.0..1.0,
    }
}

/// White to dark blue.
fn blues(t: f64) -> RGBColor {
    let t = if t.is_finite() { t.clamp(0.0, 1.0) } else { 0.0 };
    let lerp = |a: u8, b: u8| (a as f64 + (b as f64 - a as f64) * t).round() as u8;
    RGBColor(lerp(247, 8), lerp(251, 48), lerp(255, 107))
}

pub struct BarPanel {
    pub title: String,
    pub x_label: String,
    pub y_label: String,
    pub bars: Vec<(String, f64)>,
}

fn draw_bars(area: &Area, panel: &BarPanel) -> DrawResult {
    let n = panel.bars.len().max(1) as u32;
    let top = panel.bars.iter().map(|b| b.1).fold(0.0, f64::max);
    let top = if top > 0.0 { top * 1.1 } else { 1.0 };
    let labels: Vec<&str> = panel.bars.iter().map(|b| b.0.as_str()).collect();

    let mut chart = ChartBuilder::on(area)
        .caption(&panel.title, (FONT, 16))
        .margin(8)
        .x_label_area_size(50)
        .y_label_area_size(55)
        .build_cartesian_2d((0u32..n).into_segmented(), 0f64..top)?;
    chart
        .configure_mesh()
        .disable_x_mesh()
        .x_labels(labels.len())
        .x_label_formatter(&|v| match v {
            SegmentValue::CenterOf(i) => {
                labels.get(*i as usize).map(|s| s.to_string()).unwrap_or_default()
            }
            _ => String::new(),
        })
        .x_desc(panel.x_label.as_str())
        .y_desc(panel.y_label.as_str())
        .label_style((FONT, 11))
        .draw()?;
    chart.draw_series(
        Histogram::vertical(&chart)
            .style(BAR_COLOR.filled())
            .margin(6)
            .data(panel.bars.iter().enumerate().map(|(i, b)| (i as u32, b.1))),
    )?;
    Ok(())
}

/// One bar chart per panel, laid out `columns` wide.
pub fn bar_grid(path: &Path, title: &str, panels: &[BarPanel], columns: usize) -> Result<()> {
    prepare(path)?;
    let (rows, cols) = grid_shape(panels.len(), columns);
    let result = (|| -> DrawResult {
        let size = (400 * cols as u32, 340 * rows as u32 + 50);
        let root = SVGBackend::new(path, size).into_drawing_area();
        root.fill(&WHITE)?;
        let root = root.titled(title, (FONT, 28))?;
        for (area, panel) in root.split_evenly((rows, cols)).iter().zip(panels) {
            draw_bars(area, panel)?;
        }
        root.present()?;
        Ok(())
    })();
    finish(path, result)
}

/// A numeric column with its per-outcome subsets.
pub struct DistributionPanel {
    pub label: String,
    pub values: Vec<f64>,
    pub stroke: Vec<f64>,
    pub no_stroke: Vec<f64>,
}

fn draw_histogram(area: &Area, panel: &DistributionPanel) -> DrawResult {
    let x_range = axis_range(panel.values.iter().copied());
    let width = (x_range.end - x_range.start) / HISTOGRAM_BINS as f64;
    let mut counts = vec![0usize; HISTOGRAM_BINS];
    for v in panel.values.iter().filter(|v| v.is_finite()) {
        let bin = (((v - x_range.start) / width) as usize).min(HISTOGRAM_BINS - 1);
        counts[bin] += 1;
    }
    let total = panel.values.len().max(1) as f64;
    let density: Vec<f64> = counts.iter().map(|&c| c as f64 / (total * width)).collect();
    let grid = linspace(x_range.start, x_range.end, KDE_POINTS);
    let kde = gaussian_kde(&panel.values, &grid);
    let top = density.iter().chain(&kde).copied().fold(0.0, f64::max);
    let top = if top > 0.0 { top * 1.1 } else { 1.0 };

    let mut chart = ChartBuilder::on(area)
        .caption(format!("{} Histogram", panel.label), (FONT, 16))
        .margin(8)
        .x_label_area_size(35)
        .y_label_area_size(60)
        .build_cartesian_2d(x_range.clone(), 0f64..top)?;
    chart
        .configure_mesh()
        .x_desc(panel.label.as_str())
        .y_desc("Density")
        .draw()?;
    chart.draw_series(density.iter().enumerate().map(|(i, &d)| {
        let x0 = x_range.start + width * i as f64;
        Rectangle::new([(x0, 0.0), (x0 + width, d)], BAR_COLOR.mix(0.5).filled())
    }))?;
    chart.draw_series(LineSeries::new(
        grid.into_iter().zip(kde),
        BAR_COLOR.stroke_width(2),
    ))?;
    Ok(())
}

fn draw_outcome_kde(area: &Area, panel: &DistributionPanel) -> DrawResult {
    let x_range = axis_range(panel.values.iter().copied());
    let grid = linspace(x_range.start, x_range.end, KDE_POINTS);
    let stroke = gaussian_kde(&panel.stroke, &grid);
    let no_stroke = gaussian_kde(&panel.no_stroke, &grid);
    let top = stroke.iter().chain(&no_stroke).copied().fold(0.0, f64::max);
    let top = if top > 0.0 { top * 1.1 } else { 1.0 };

    let mut chart = ChartBuilder::on(area)
        .caption(format!("{} Distribution by Outcome", panel.label), (FONT, 16))
        .margin(8)
        .x_label_area_size(35)
        .y_label_area_size(60)
        .build_cartesian_2d(x_range, 0f64..top)?;
    chart
        .configure_mesh()
        .x_desc(panel.label.as_str())
        .y_desc("Density")
        .draw()?;
    for (label, color, alpha, curve) in [
        ("stroke", STROKE_COLOR, 0.6, stroke),
        ("no stroke", NO_STROKE_COLOR, 0.3, no_stroke),
    ] {
        chart
            .draw_series(
                AreaSeries::new(grid.iter().copied().zip(curve), 0.0, &color.mix(alpha))
                    .border_style(&color),
            )?
            .label(label)
            .legend(move |(x, y)| Rectangle::new([(x, y - 5), (x + 15, y + 5)], color.filled()));
    }
    chart
        .configure_series_labels()
        .background_style(&WHITE.mix(0.8))
        .border_style(&BLACK)
        .draw()?;
    Ok(())
}

/// Histogram with density estimate on top, per-outcome densities below.
pub fn distributions(path: &Path, panels: &[DistributionPanel]) -> Result<()> {
    prepare(path)?;
    let cols = panels.len().max(1);
    let result = (|| -> DrawResult {
        let root = SVGBackend::new(path, (480 * cols as u32, 760)).into_drawing_area();
        root.fill(&WHITE)?;
        let root = root.titled("Continuous Variable Distribution", (FONT, 28))?;
        let areas = root.split_evenly((2, cols));
        for (i, panel) in panels.iter().enumerate() {
            draw_histogram(&areas[i], panel)?;
            draw_outcome_kde(&areas[cols + i], panel)?;
        }
        root.present()?;
        Ok(())
    })();
    finish(path, result)
}

/// Colored cells with row labels on the left and column labels on top.
/// `annotate` renders the text of cell `(row, column)`.
fn draw_heatmap(
    area: &Area,
    title: &str,
    matrix: &LabeledMatrix,
    range: (f64, f64),
    annotate: &dyn Fn(usize, usize, f64) -> String,
) -> DrawResult {
    let (nr, nc) = (matrix.rows.len(), matrix.columns.len());
    if nr == 0 || nc == 0 {
        return Ok(());
    }
    // room for labels, in cell units
    let label_width = 3.0;
    let label_height = 0.7;
    let mut chart = ChartBuilder::on(area)
        .caption(title, (FONT, 15))
        .margin(10)
        .build_cartesian_2d(-label_width..nc as f64, -(nr as f64)..label_height)?;

    let span = range.1 - range.0;
    let scale = |v: f64| if span > 0.0 { (v - range.0) / span } else { 0.5 };
    let mut cells = Vec::with_capacity(nr * nc);
    let mut texts = Vec::with_capacity(nr * nc);
    for (i, row) in matrix.values.iter().enumerate() {
        for (j, &value) in row.iter().enumerate() {
            let (x, y) = (j as f64, -(i as f64));
            let fill = if value.is_finite() {
                blues(scale(value))
            } else {
                RGBColor(220, 220, 220)
            };
            cells.push(Rectangle::new([(x, y), (x + 1.0, y - 1.0)], fill.filled()));
            cells.push(Rectangle::new([(x, y), (x + 1.0, y - 1.0)], WHITE.stroke_width(1)));
            let ink: &RGBColor = if value.is_finite() && scale(value) > 0.6 {
                &WHITE
            } else {
                &BLACK
            };
            texts.push(Text::new(
                annotate(i, j, value),
                (x + 0.5, y - 0.5),
                (FONT, 11)
                    .into_font()
                    .color(ink)
                    .pos(Pos::new(HPos::Center, VPos::Center)),
            ));
        }
    }
    chart.draw_series(cells)?;
    chart.draw_series(texts)?;

    let row_style = (FONT, 11).into_font().color(&BLACK).pos(Pos::new(HPos::Right, VPos::Center));
    chart.draw_series(matrix.rows.iter().enumerate().map(|(i, name)| {
        Text::new(display_name(name), (-0.1, -(i as f64) - 0.5), row_style.clone())
    }))?;
    let column_style = (FONT, 10)
        .into_font()
        .color(&BLACK)
        .pos(Pos::new(HPos::Center, VPos::Bottom));
    chart.draw_series(matrix.columns.iter().enumerate().map(|(j, name)| {
        Text::new(display_name(name), (j as f64 + 0.5, 0.1), column_style.clone())
    }))?;
    Ok(())
}

fn heatmap_size(matrix: &LabeledMatrix) -> (u32, u32) {
    (
        70 * (matrix.columns.len() as u32 + 3) + 40,
        45 * matrix.rows.len() as u32 + 110,
    )
}

fn format_value(value: f64, decimals: usize) -> String {
    if value.is_finite() {
        format!("{value:.decimals$}")
    } else {
        "nan".to_string()
    }
}

/// A single annotated heatmap. Without `range`, the color scale spans the
/// finite values of the matrix.
pub fn heatmap(
    path: &Path,
    title: &str,
    matrix: &LabeledMatrix,
    range: Option<(f64, f64)>,
    decimals: usize,
) -> Result<()> {
    prepare(path)?;
    let range = range.unwrap_or_else(|| {
        let finite: Vec<f64> = matrix
            .values
            .iter()
            .flatten()
            .copied()
            .filter(|v| v.is_finite())
            .collect();
        min_max(&finite).unwrap_or((0.0, 1.0))
    });
    let result = (|| -> DrawResult {
        let root = SVGBackend::new(path, heatmap_size(matrix)).into_drawing_area();
        root.fill(&WHITE)?;
        draw_heatmap(&root, title, matrix, range, &|_, _, v| format_value(v, decimals))?;
        root.present()?;
        Ok(())
    })();
    finish(path, result)
}

/// Several heatmaps side by side sharing one color range.
pub fn heatmap_row(
    path: &Path,
    title: &str,
    panels: &[(&str, &LabeledMatrix)],
    range: (f64, f64),
) -> Result<()> {
    prepare(path)?;
    let result = (|| -> DrawResult {
        let sizes: Vec<(u32, u32)> = panels.iter().map(|(_, m)| heatmap_size(m)).collect();
        let width: u32 = sizes.iter().map(|s| s.0).sum::<u32>().max(200);
        let height = sizes.iter().map(|s| s.1).max().unwrap_or(200) + 50;
        let root = SVGBackend::new(path, (width, height)).into_drawing_area();
        root.fill(&WHITE)?;
        let root = root.titled(title, (FONT, 28))?;
        let breaks: Vec<i32> = sizes
            .iter()
            .scan(0i32, |acc, s| {
                *acc += s.0 as i32;
                Some(*acc)
            })
            .take(panels.len().saturating_sub(1))
            .collect();
        let areas = root.split_by_breakpoints(breaks, Vec::<i32>::new());
        for (area, (name, matrix)) in areas.iter().zip(panels) {
            draw_heatmap(area, name, matrix, range, &|_, _, v| format_value(v, 2))?;
        }
        root.present()?;
        Ok(())
    })();
    finish(path, result)
}

/// A named polyline.
pub struct Line {
    pub label: String,
    pub points: Vec<(f64, f64)>,
    pub color: RGBColor,
}

impl Line {
    pub fn solid(label: impl Into<String>, points: Vec<(f64, f64)>) -> Self {
        Self {
            label: label.into(),
            points,
            color: NO_STROKE_COLOR,
        }
    }

    /// Grey guide line such as a no-skill baseline.
    pub fn reference(label: impl Into<String>, points: Vec<(f64, f64)>) -> Self {
        Self {
            label: label.into(),
            points,
            color: REFERENCE_COLOR,
        }
    }

    pub fn with_color(mut self, color: RGBColor) -> Self {
        self.color = color;
        self
    }
}

fn draw_lines(
    area: &Area,
    title: &str,
    x_label: &str,
    y_label: &str,
    lines: &[Line],
    ranges: Option<(Range<f64>, Range<f64>)>,
) -> DrawResult {
    let (x_range, y_range) = ranges.unwrap_or_else(|| {
        (
            axis_range(lines.iter().flat_map(|l| l.points.iter().map(|p| p.0))),
            axis_range(lines.iter().flat_map(|l| l.points.iter().map(|p| p.1))),
        )
    });
    let mut chart = ChartBuilder::on(area)
        .caption(title, (FONT, 16))
        .margin(10)
        .x_label_area_size(40)
        .y_label_area_size(55)
        .build_cartesian_2d(x_range, y_range)?;
    chart.configure_mesh().x_desc(x_label).y_desc(y_label).draw()?;
    for line in lines {
        let color = line.color;
        chart
            .draw_series(LineSeries::new(line.points.iter().copied(), color.stroke_width(2)))?
            .label(line.label.as_str())
            .legend(move |(x, y)| {
                PathElement::new(vec![(x, y), (x + 20, y)], color.stroke_width(2))
            });
    }
    if lines.iter().any(|l| !l.label.is_empty()) {
        chart
            .configure_series_labels()
            .background_style(&WHITE.mix(0.8))
            .border_style(&BLACK)
            .draw()?;
    }
    Ok(())
}

pub fn line_chart(
    path: &Path,
    title: &str,
    x_label: &str,
    y_label: &str,
    lines: &[Line],
) -> Result<()> {
    prepare(path)?;
    let result = (|| -> DrawResult {
        let root = SVGBackend::new(path, (800, 520)).into_drawing_area();
        root.fill(&WHITE)?;
        draw_lines(&root, title, x_label, y_label, lines, None)?;
        root.present()?;
        Ok(())
    })();
    finish(path, result)
}

/// Two-dimensional points colored by class label.
pub struct ScatterPanel {
    pub title: String,
    pub points: Vec<(f64, f64)>,
    pub labels: Vec<i32>,
}

fn draw_scatter(area: &Area, panel: &ScatterPanel) -> DrawResult {
    let mut chart = ChartBuilder::on(area)
        .caption(&panel.title, (FONT, 16))
        .margin(10)
        .x_label_area_size(40)
        .y_label_area_size(55)
        .build_cartesian_2d(
            axis_range(panel.points.iter().map(|p| p.0)),
            axis_range(panel.points.iter().map(|p| p.1)),
        )?;
    chart
        .configure_mesh()
        .x_desc("Principal Component 1")
        .y_desc("Principal Component 2")
        .draw()?;
    for (class, name, color) in [(0, "no stroke", NO_STROKE_COLOR), (1, "stroke", STROKE_COLOR)] {
        chart
            .draw_series(
                panel
                    .points
                    .iter()
                    .zip(&panel.labels)
                    .filter(|(_, &label)| label == class)
                    .map(|(&p, _)| Circle::new(p, 2, color.mix(0.6).filled())),
            )?
            .label(name)
            .legend(move |(x, y)| Circle::new((x + 8, y), 4, color.filled()));
    }
    chart
        .configure_series_labels()
        .background_style(&WHITE.mix(0.8))
        .border_style(&BLACK)
        .draw()?;
    Ok(())
}

pub fn scatter_grid(path: &Path, title: &str, panels: &[ScatterPanel]) -> Result<()> {
    prepare(path)?;
    let cols = panels.len().max(1);
    let result = (|| -> DrawResult {
        let root = SVGBackend::new(path, (560 * cols as u32, 560)).into_drawing_area();
        root.fill(&WHITE)?;
        let root = root.titled(title, (FONT, 26))?;
        for (area, panel) in root.split_evenly((1, cols)).iter().zip(panels) {
            draw_scatter(area, panel)?;
        }
        root.present()?;
        Ok(())
    })();
    finish(path, result)
}

/// Confusion matrix, ROC, precision-recall and threshold curves of one model.
pub fn evaluation_figure(path: &Path, evaluation: &Evaluation) -> Result<()> {
    prepare(path)?;
    let result = (|| -> DrawResult {
        let root = SVGBackend::new(path, (1200, 1000)).into_drawing_area();
        root.fill(&WHITE)?;
        let root = root.titled(&evaluation.model_name, (FONT, 28))?;
        let areas = root.split_evenly((2, 2));

        let counts = evaluation.confusion.as_rows();
        let confusion = LabeledMatrix {
            rows: vec!["actual no stroke".to_string(), "actual stroke".to_string()],
            columns: vec!["predicted no stroke".to_string(), "predicted stroke".to_string()],
            values: evaluation
                .confusion
                .row_fractions()
                .iter()
                .map(|row| row.to_vec())
                .collect(),
        };
        draw_heatmap(&areas[0], "Confusion Matrix", &confusion, (0.0, 1.0), &|i, j, v| {
            format!("{} ({:.1}%)", counts[i][j], v * 100.0)
        })?;

        let unit = Some((0f64..1f64, 0f64..1.02f64));
        let mut roc_lines = vec![Line::reference("no skill", vec![(0.0, 0.0), (1.0, 1.0)])];
        if let Some(roc) = &evaluation.roc {
            roc_lines.push(
                Line::solid(
                    format!("AUC = {:.4}", evaluation.auroc),
                    roc.fpr.iter().copied().zip(roc.tpr.iter().copied()).collect(),
                )
                .with_color(STROKE_COLOR),
            );
        }
        draw_lines(
            &areas[1],
            "ROC Curve",
            "False Positive Rate",
            "True Positive Rate",
            &roc_lines,
            unit.clone(),
        )?;

        let mut pr_lines = vec![Line::reference(
            format!("baseline = {:.4}", evaluation.baseline),
            vec![(0.0, evaluation.baseline), (1.0, evaluation.baseline)],
        )];
        let mut threshold_lines = Vec::new();
        if let Some(prc) = &evaluation.prc {
            pr_lines.push(
                Line::solid(
                    format!("AUPRC = {:.4}", evaluation.auprc),
                    prc.recall.iter().copied().zip(prc.precision.iter().copied()).collect(),
                )
                .with_color(STROKE_COLOR),
            );
            let n = prc.thresholds.len();
            threshold_lines.push(Line::solid(
                "precision",
                prc.thresholds.iter().copied().zip(prc.precision[..n].iter().copied()).collect(),
            ));
            threshold_lines.push(
                Line::solid(
                    "recall",
                    prc.thresholds.iter().copied().zip(prc.recall[..n].iter().copied()).collect(),
                )
                .with_color(STROKE_COLOR),
            );
        }
        draw_lines(&areas[2], "Precision-Recall Curve", "Recall", "Precision", &pr_lines, unit)?;
        draw_lines(
            &areas[3],
            "Precision and Recall vs. Threshold",
            "Threshold",
            "Score",
            &threshold_lines,
            None,
        )?;
        root.present()?;
        Ok(())
    })();
    finish(path, result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::evaluate;

    fn svg(path: &Path) -> String {
        fs::read_to_string(path).unwrap()
    }

    #[test]
    fn renders_every_figure_kind() {
        let dir = tempfile::tempdir().unwrap();

        let bars = dir.path().join("nested/bars.svg");
        bar_grid(
            &bars,
            "Counts",
            &[BarPanel {
                title: "Gender Count".into(),
                x_label: "Gender".into(),
                y_label: "Count".into(),
                bars: vec![("Female".into(), 3.0), ("Male".into(), 2.0)],
            }],
            4,
        )
        .unwrap();
        assert!(svg(&bars).contains("<svg"));

        let matrix = LabeledMatrix {
            rows: vec!["age".into(), "bmi".into()],
            columns: vec!["age".into(), "bmi".into()],
            values: vec![vec![1.0, 0.33], vec![0.33, f64::NAN]],
        };
        let heat = dir.path().join("heat.svg");
        heatmap(&heat, "Correlation", &matrix, Some((0.0, 1.0)), 2).unwrap();
        assert!(svg(&heat).contains("0.33"));

        let truth = [0, 0, 1, 1, 0, 1];
        let scores = [0.1, 0.4, 0.35, 0.8, 0.2, 0.9];
        let predicted: Vec<i32> = scores.iter().map(|&s| i32::from(s > 0.5)).collect();
        let evaluation = evaluate("Toy", &truth, &predicted, &scores);
        let figure = dir.path().join("toy.svg");
        evaluation_figure(&figure, &evaluation).unwrap();
        assert!(svg(&figure).contains("ROC Curve"));

        let dist = dir.path().join("dist.svg");
        distributions(
            &dist,
            &[DistributionPanel {
                label: "Age".into(),
                values: vec![1.0, 2.0, 2.5, 3.0, 7.0],
                stroke: vec![3.0, 7.0],
                no_stroke: vec![1.0, 2.0, 2.5],
            }],
        )
        .unwrap();
        assert!(dist.exists());

        let scatter = dir.path().join("scatter.svg");
        scatter_grid(
            &scatter,
            "PCA",
            &[ScatterPanel {
                title: "before".into(),
                points: vec![(0.0, 1.0), (1.0, 0.5), (2.0, 2.0)],
                labels: vec![0, 1, 0],
            }],
        )
        .unwrap();
        assert!(scatter.exists());
    }

    #[test]
    fn color_scale_endpoints() {
        let rgb = |c: RGBColor| (c.0, c.1, c.2);
        assert_eq!(rgb(blues(0.0)), (247, 251, 255));
        assert_eq!(rgb(blues(1.0)), (8, 48, 107));
        assert_eq!(rgb(blues(f64::NAN)), rgb(blues(0.0)));
    }
}
