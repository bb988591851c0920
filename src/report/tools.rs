//! Chart rendering and report persistence tools
//!
//! The report loop's tools. Unlike the analyst tools these take the
//! structured analysis record as an explicit `analysis_data` parameter;
//! the report generator injects it into every tool call so the tools
//! never depend on shared mutable state.
//!
//! Charts are rendered as standalone SVG documents through plotters.

use crate::error::WorkflowError;
use crate::models::{AnalysisRecord, StockReport};
use crate::tools::Tool;
use crate::Result;
use async_trait::async_trait;
use chrono::Local;
use plotters::prelude::*;
use plotters::style::text_anchor::{HPos, Pos, VPos};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use tracing::{info, warn};

const CHART_EXTENSIONS: &[&str] = &["svg", "png", "jpg", "jpeg", "pdf", "webp"];
const REPORT_EXTENSIONS: &[&str] = &["md", "txt", "pdf"];

/// What kind of chart to draw for a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChartKind {
    /// 52-week low / current / high bars plus key metrics.
    PriceRange,
    /// Side-by-side price and 52-week position panels.
    Comparison,
    /// Five-axis valuation radar.
    Radar,
}

/// Trait for chart rendering
#[async_trait]
pub trait ChartRenderer: Send + Sync {
    async fn render(&self, kind: ChartKind, record: &AnalysisRecord, path: &Path)
        -> Result<PathBuf>;
}

/// Output format for saved reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportFormat {
    Txt,
    Md,
    Pdf,
}

impl ReportFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ReportFormat::Txt => "txt",
            ReportFormat::Md => "md",
            ReportFormat::Pdf => "pdf",
        }
    }
}

impl FromStr for ReportFormat {
    type Err = WorkflowError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "txt" => Ok(ReportFormat::Txt),
            "md" | "markdown" => Ok(ReportFormat::Md),
            "pdf" => Ok(ReportFormat::Pdf),
            other => Err(WorkflowError::Report(format!(
                "지원하지 않는 형식입니다: {}. 지원 형식: txt, md, pdf",
                other
            ))),
        }
    }
}

/// Trait for report persistence
#[async_trait]
pub trait ReportSink: Send + Sync {
    async fn save(
        &self,
        text: &str,
        format: ReportFormat,
        path: &Path,
        charts: &[String],
    ) -> Result<PathBuf>;
}

//
// ================= SVG chart renderer =================
//

/// matplotlib's default category palette, one color per compared stock.
const SERIES_COLORS: [RGBColor; 5] = [
    RGBColor(31, 119, 180),
    RGBColor(255, 127, 14),
    RGBColor(44, 160, 44),
    RGBColor(214, 39, 40),
    RGBColor(148, 103, 189),
];

const RADAR_AXES: [&str; 5] = ["Growth", "Value", "Momentum", "Quality", "Sentiment"];

/// Renders charts to SVG files with plotters.
pub struct SvgChartRenderer;

#[async_trait]
impl ChartRenderer for SvgChartRenderer {
    async fn render(
        &self,
        kind: ChartKind,
        record: &AnalysisRecord,
        path: &Path,
    ) -> Result<PathBuf> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        match (kind, record) {
            (ChartKind::PriceRange, AnalysisRecord::Single(report)) => {
                draw_price_range(report, path)?
            }
            (ChartKind::Comparison, AnalysisRecord::Comparison(comparison)) => {
                if comparison.stocks.is_empty() {
                    return Err(WorkflowError::Chart(
                        "비교할 주식 데이터가 없습니다".to_string(),
                    ));
                }
                draw_comparison(&comparison.stocks, path)?
            }
            (ChartKind::Radar, AnalysisRecord::Single(report)) => {
                let series = [(report.ticker.clone(), ValuationScores::for_stock(report))];
                draw_radar(&series, path)?
            }
            (ChartKind::Radar, AnalysisRecord::Comparison(comparison)) => {
                if comparison.stocks.is_empty() {
                    return Err(WorkflowError::Chart(
                        "비교할 주식 데이터가 없습니다".to_string(),
                    ));
                }
                draw_radar(&ValuationScores::comparative(&comparison.stocks), path)?
            }
            _ => {
                return Err(WorkflowError::Chart(
                    "이 분석 유형으로는 차트를 그릴 수 없습니다".to_string(),
                ))
            }
        }

        info!(path = %path.display(), "Chart rendered");
        Ok(path.to_path_buf())
    }
}

fn chart_err<E: std::fmt::Display>(e: E) -> WorkflowError {
    WorkflowError::Chart(e.to_string())
}

fn bar_label_style() -> TextStyle<'static> {
    TextStyle::from(("sans-serif", 13).into_font()).pos(Pos::new(HPos::Center, VPos::Bottom))
}

fn draw_price_range(report: &StockReport, path: &Path) -> Result<()> {
    let mut high = report.metrics.week52_high;
    let mut low = report.metrics.week52_low;
    let current = report.current_price;

    // Backfill a missing 52-week bound from the current price.
    if high == 0.0 || low == 0.0 {
        if current <= 0.0 {
            return Err(WorkflowError::Chart(format!(
                "{}: 가격 데이터가 충분하지 않습니다",
                report.ticker
            )));
        }
        if high == 0.0 {
            high = current;
        }
        if low == 0.0 {
            low = current;
        }
    }

    let y_max = high.max(current).max(1.0) * 1.18;
    let bars = [
        ("52W Low", low, SERIES_COLORS[3]),
        ("Current", current, SERIES_COLORS[2]),
        ("52W High", high, SERIES_COLORS[0]),
    ];

    let root = SVGBackend::new(path, (640, 400)).into_drawing_area();
    root.fill(&WHITE).map_err(chart_err)?;

    let mut chart = ChartBuilder::on(&root)
        .caption(
            format!("{} ({}) - Price Range", report.company_name, report.ticker),
            ("sans-serif", 18),
        )
        .margin(16)
        .x_label_area_size(36)
        .y_label_area_size(56)
        .build_cartesian_2d(0f64..3f64, 0f64..y_max)
        .map_err(chart_err)?;

    let mut mesh = chart.configure_mesh();
    mesh.disable_x_mesh().x_labels(0).y_desc("Price ($)");
    if high > low {
        let position = (current - low) / (high - low) * 100.0;
        mesh.x_desc(format!("Position: {:.1}% of 52W range", position));
    }
    mesh.draw().map_err(chart_err)?;

    chart
        .draw_series(bars.iter().enumerate().map(|(idx, &(_, price, color))| {
            let x = idx as f64;
            Rectangle::new(
                [(x + 0.15, 0.0), (x + 0.85, price.max(0.0))],
                color.mix(0.7).filled(),
            )
        }))
        .map_err(chart_err)?;
    chart
        .draw_series(bars.iter().enumerate().map(|(idx, &(label, price, _))| {
            Text::new(
                format!("{} ${:.2}", label, price),
                (idx as f64 + 0.5, price.max(0.0) + y_max * 0.02),
                bar_label_style(),
            )
        }))
        .map_err(chart_err)?;

    root.present().map_err(chart_err)
}

fn draw_comparison(stocks: &[StockReport], path: &Path) -> Result<()> {
    let max_price = stocks
        .iter()
        .map(|s| s.current_price)
        .fold(1.0_f64, f64::max);
    let count = stocks.len() as f64;

    let root = SVGBackend::new(path, (880, 400)).into_drawing_area();
    root.fill(&WHITE).map_err(chart_err)?;
    let (price_area, position_area) = root.split_horizontally(470);

    let mut price_chart = ChartBuilder::on(&price_area)
        .caption("Current Price", ("sans-serif", 16))
        .margin(12)
        .x_label_area_size(28)
        .y_label_area_size(56)
        .build_cartesian_2d(0f64..count, 0f64..max_price * 1.18)
        .map_err(chart_err)?;
    price_chart
        .configure_mesh()
        .disable_x_mesh()
        .x_labels(0)
        .y_desc("Price ($)")
        .draw()
        .map_err(chart_err)?;
    price_chart
        .draw_series(stocks.iter().enumerate().map(|(idx, stock)| {
            let color = SERIES_COLORS[idx % SERIES_COLORS.len()];
            let x = idx as f64;
            Rectangle::new(
                [(x + 0.15, 0.0), (x + 0.85, stock.current_price.max(0.0))],
                color.mix(0.7).filled(),
            )
        }))
        .map_err(chart_err)?;
    price_chart
        .draw_series(stocks.iter().enumerate().map(|(idx, stock)| {
            Text::new(
                format!("{} ${:.2}", stock.ticker, stock.current_price),
                (
                    idx as f64 + 0.5,
                    stock.current_price.max(0.0) + max_price * 0.03,
                ),
                bar_label_style(),
            )
        }))
        .map_err(chart_err)?;

    // Right panel: normalized position in the 52-week range. Stocks with
    // incomplete range data are skipped there but keep their price bar.
    let mut position_chart = ChartBuilder::on(&position_area)
        .caption("52-Week Position", ("sans-serif", 16))
        .margin(12)
        .x_label_area_size(28)
        .y_label_area_size(16)
        .build_cartesian_2d(0f64..1.1f64, 0f64..count)
        .map_err(chart_err)?;
    position_chart
        .configure_mesh()
        .disable_y_mesh()
        .y_labels(0)
        .x_desc("Range position")
        .draw()
        .map_err(chart_err)?;

    let positions: Vec<(usize, &StockReport, f64)> = stocks
        .iter()
        .enumerate()
        .filter_map(|(idx, stock)| {
            let high = stock.metrics.week52_high;
            let low = stock.metrics.week52_low;
            if high > low && low > 0.0 && stock.current_price > 0.0 {
                let position = ((stock.current_price - low) / (high - low)).clamp(0.0, 1.0);
                Some((idx, stock, position))
            } else {
                None
            }
        })
        .collect();
    position_chart
        .draw_series(positions.iter().map(|&(idx, _, position)| {
            let color = SERIES_COLORS[idx % SERIES_COLORS.len()];
            let y = count - idx as f64 - 1.0;
            Rectangle::new(
                [(0.0, y + 0.2), (position, y + 0.8)],
                color.mix(0.7).filled(),
            )
        }))
        .map_err(chart_err)?;
    position_chart
        .draw_series(positions.iter().map(|&(idx, stock, position)| {
            let style = TextStyle::from(("sans-serif", 12).into_font())
                .pos(Pos::new(HPos::Left, VPos::Center));
            Text::new(
                format!("{} {:.1}%", stock.ticker, position * 100.0),
                (position + 0.02, count - idx as f64 - 0.5),
                style,
            )
        }))
        .map_err(chart_err)?;

    root.present().map_err(chart_err)
}

fn draw_radar(series: &[(String, ValuationScores)], path: &Path) -> Result<()> {
    let (cx, cy, radius) = (300.0_f64, 310.0_f64, 210.0_f64);

    let root = SVGBackend::new(path, (600, 600)).into_drawing_area();
    root.fill(&WHITE).map_err(chart_err)?;

    let title_style =
        TextStyle::from(("sans-serif", 18).into_font()).pos(Pos::new(HPos::Center, VPos::Top));
    root.draw(&Text::new("Valuation Radar", (300, 16), title_style))
        .map_err(chart_err)?;

    // Grid rings and axis labels.
    let grid = RGBColor(204, 204, 204);
    for ring in [0.2, 0.4, 0.6, 0.8, 1.0] {
        let outline = radar_polygon(cx, cy, radius * ring, |_| 1.0);
        root.draw(&PathElement::new(outline, grid.stroke_width(1)))
            .map_err(chart_err)?;
    }
    for (idx, axis) in RADAR_AXES.iter().enumerate() {
        let (x, y) = radar_point(cx, cy, radius * 1.14, idx, RADAR_AXES.len(), 1.0);
        let style = TextStyle::from(("sans-serif", 13).into_font())
            .pos(Pos::new(HPos::Center, VPos::Center));
        root.draw(&Text::new(*axis, (x as i32, y as i32), style))
            .map_err(chart_err)?;
    }

    for (idx, (label, scores)) in series.iter().enumerate() {
        let color = SERIES_COLORS[idx % SERIES_COLORS.len()];
        let values = scores.as_array();
        let outline = radar_polygon(cx, cy, radius, |i| values[i]);
        root.draw(&Polygon::new(
            outline[..outline.len() - 1].to_vec(),
            color.mix(0.2).filled(),
        ))
        .map_err(chart_err)?;
        root.draw(&PathElement::new(outline, color.stroke_width(2)))
            .map_err(chart_err)?;

        let legend_style = TextStyle::from(("sans-serif", 12).into_font()).color(&color);
        root.draw(&Text::new(
            label.as_str(),
            (20, 40 + idx as i32 * 18),
            legend_style,
        ))
        .map_err(chart_err)?;
    }

    root.present().map_err(chart_err)
}

/// Closed outline of a radar polygon in pixel coordinates.
fn radar_polygon(cx: f64, cy: f64, radius: f64, value: impl Fn(usize) -> f64) -> Vec<(i32, i32)> {
    let n = RADAR_AXES.len();
    let mut points: Vec<(i32, i32)> = (0..n)
        .map(|i| {
            let (x, y) = radar_point(cx, cy, radius, i, n, value(i));
            (x as i32, y as i32)
        })
        .collect();
    if let Some(&first) = points.first() {
        points.push(first);
    }
    points
}

fn radar_point(cx: f64, cy: f64, radius: f64, index: usize, n: usize, value: f64) -> (f64, f64) {
    let angle = std::f64::consts::TAU * index as f64 / n as f64 - std::f64::consts::FRAC_PI_2;
    (
        cx + radius * value * angle.cos(),
        cy + radius * value * angle.sin(),
    )
}

//
// ================= Valuation scoring =================
//

/// Five-axis valuation scores, each in [0, 1].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ValuationScores {
    pub growth: f64,
    pub value: f64,
    pub momentum: f64,
    pub quality: f64,
    pub sentiment: f64,
}

const STABLE_SECTORS: &[&str] = &[
    "healthcare",
    "consumer staples",
    "utilities",
    "consumer defensive",
];
const GROWTH_SECTORS: &[&str] = &["technology", "communication services", "consumer cyclical"];

impl ValuationScores {
    fn as_array(&self) -> [f64; 5] {
        [
            self.growth,
            self.value,
            self.momentum,
            self.quality,
            self.sentiment,
        ]
    }

    /// Absolute scoring of one stock against broad-market heuristics.
    pub fn for_stock(report: &StockReport) -> Self {
        let metrics = &report.metrics;
        let market_cap = metrics.market_cap;
        let pe_ratio = metrics.pe_ratio.unwrap_or(20.0);

        // Growth: smaller caps have more room to grow.
        let growth = if market_cap >= 2e12 {
            0.50
        } else if market_cap >= 1e12 {
            0.60
        } else if market_cap >= 1e11 {
            0.75
        } else if market_cap >= 1e10 {
            0.85
        } else {
            0.90
        };

        // Value: low P/E scores higher, negative or missing P/E is neutral.
        let value = if pe_ratio <= 0.0 {
            0.50
        } else if pe_ratio < 10.0 {
            0.95
        } else if pe_ratio < 15.0 {
            0.85
        } else if pe_ratio < 20.0 {
            0.70
        } else if pe_ratio < 25.0 {
            0.55
        } else if pe_ratio < 30.0 {
            0.40
        } else if pe_ratio < 40.0 {
            0.25
        } else {
            0.15
        };

        // Momentum: position inside the 52-week range.
        let momentum = if metrics.week52_high > metrics.week52_low
            && metrics.week52_low > 0.0
            && report.current_price > 0.0
        {
            ((report.current_price - metrics.week52_low)
                / (metrics.week52_high - metrics.week52_low))
                .clamp(0.0, 1.0)
        } else {
            0.50
        };

        let base_quality = if market_cap >= 2e12 {
            0.85
        } else if market_cap >= 1e12 {
            0.75
        } else if market_cap >= 5e11 {
            0.65
        } else if market_cap >= 1e11 {
            0.55
        } else {
            0.45
        };
        let sector = metrics.sector.as_deref().unwrap_or("").to_lowercase();
        let quality = if STABLE_SECTORS.iter().any(|s| sector.contains(s)) {
            (base_quality + 0.10_f64).min(1.0)
        } else if GROWTH_SECTORS.iter().any(|s| sector.contains(s)) {
            (base_quality + 0.05_f64).min(1.0)
        } else {
            base_quality
        };

        let recommendation = report
            .analyst_recommendation
            .as_deref()
            .unwrap_or("")
            .to_lowercase();
        let sentiment = if recommendation.contains("strong buy") {
            0.95
        } else if recommendation.contains("strong sell") {
            0.10
        } else if recommendation.contains("buy") {
            0.80
        } else if recommendation.contains("outperform") || recommendation.contains("overweight") {
            0.70
        } else if recommendation.contains("hold") || recommendation.contains("neutral") {
            0.50
        } else if recommendation.contains("underperform") || recommendation.contains("underweight")
        {
            0.30
        } else if recommendation.contains("sell") {
            0.20
        } else {
            0.60
        };

        Self {
            growth,
            value,
            momentum,
            quality,
            sentiment,
        }
    }

    /// Relative min-max scoring across the compared stocks.
    pub fn comparative(stocks: &[StockReport]) -> Vec<(String, Self)> {
        let pe_ratios: Vec<f64> = stocks
            .iter()
            .map(|s| {
                let pe = s.metrics.pe_ratio.unwrap_or(20.0);
                if pe > 0.0 {
                    pe
                } else {
                    20.0
                }
            })
            .collect();
        let caps: Vec<f64> = stocks.iter().map(|s| s.metrics.market_cap).collect();

        let (min_pe, max_pe) = min_max(&pe_ratios);
        let (min_cap, max_cap) = min_max(&caps);

        stocks
            .iter()
            .enumerate()
            .map(|(idx, stock)| {
                let growth = if max_cap > min_cap {
                    0.40 + (1.0 - (caps[idx] - min_cap) / (max_cap - min_cap)) * 0.50
                } else {
                    0.65
                };
                let value = if max_pe > min_pe {
                    0.30 + (1.0 - (pe_ratios[idx] - min_pe) / (max_pe - min_pe)) * 0.65
                } else {
                    0.60
                };
                let absolute = Self::for_stock(stock);
                let mut quality = if max_cap > min_cap {
                    0.50 + (caps[idx] - min_cap) / (max_cap - min_cap) * 0.45
                } else {
                    0.70
                };
                let sector = stock
                    .metrics
                    .sector
                    .as_deref()
                    .unwrap_or("")
                    .to_lowercase();
                if STABLE_SECTORS.iter().any(|s| sector.contains(s)) {
                    quality = (quality + 0.05_f64).min(1.0);
                }
                let sentiment = value * 0.6 + quality * 0.4;

                (
                    stock.ticker.clone(),
                    Self {
                        growth,
                        value,
                        momentum: absolute.momentum,
                        quality,
                        sentiment,
                    },
                )
            })
            .collect()
    }
}

fn min_max(values: &[f64]) -> (f64, f64) {
    values.iter().fold((f64::MAX, f64::MIN), |(lo, hi), &v| {
        (lo.min(v), hi.max(v))
    })
}

//
// ================= File report sink =================
//

/// Saves reports as plain files. Markdown output embeds chart links.
pub struct FileReportSink;

#[async_trait]
impl ReportSink for FileReportSink {
    async fn save(
        &self,
        text: &str,
        format: ReportFormat,
        path: &Path,
        charts: &[String],
    ) -> Result<PathBuf> {
        if format == ReportFormat::Pdf {
            return Err(WorkflowError::Report(
                "PDF 저장은 지원되지 않습니다. md 또는 txt 형식을 사용하세요".to_string(),
            ));
        }

        let mut body = text.to_string();
        if format == ReportFormat::Md && !charts.is_empty() {
            body.push_str("\n\n## Charts\n\n");
            for chart in charts {
                body.push_str(&format!("![chart]({})\n", chart));
            }
        }

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, body).await?;
        info!(path = %path.display(), "Report saved");
        Ok(path.to_path_buf())
    }
}

//
// ================= Report-side tools =================
//

fn parse_record_input(input: &Value) -> Option<AnalysisRecord> {
    let data = input.get("analysis_data")?;
    serde_json::from_value(data.clone()).ok()
}

pub struct DrawStockChartTool {
    pub renderer: Arc<dyn ChartRenderer>,
    pub charts_dir: PathBuf,
}

#[async_trait]
impl Tool for DrawStockChartTool {
    fn name(&self) -> &'static str {
        "draw_stock_chart"
    }

    fn description(&self) -> &'static str {
        "Draw a price chart (52-week range for one stock, comparison panels for several) from analysis_data"
    }

    async fn execute(&self, input: &Value) -> Result<String> {
        let Some(record) = parse_record_input(input) else {
            return Ok("❌ 분석 데이터를 찾을 수 없습니다. analysis_data가 설정되지 않았습니다.".to_string());
        };

        let raw_path = input
            .get("output_path")
            .and_then(Value::as_str)
            .unwrap_or("stock_chart.svg");
        let path = sanitize_output_path(raw_path, &self.charts_dir, CHART_EXTENSIONS, "svg");

        let kind = match &record {
            AnalysisRecord::Single(_) => ChartKind::PriceRange,
            AnalysisRecord::Comparison(_) => ChartKind::Comparison,
            AnalysisRecord::Rag(_) => return Ok("알 수 없는 분석 유형입니다.".to_string()),
        };

        match self.renderer.render(kind, &record, &path).await {
            Ok(saved) => Ok(match kind {
                ChartKind::Comparison => {
                    format!("✓ 비교 차트가 {}에 저장되었습니다.", saved.display())
                }
                _ => format!("✓ 차트가 {}에 저장되었습니다.", saved.display()),
            }),
            Err(e) => {
                warn!("Chart rendering failed: {}", e);
                Ok(format!("차트 생성 중 오류 발생: {}", e))
            }
        }
    }
}

pub struct DrawValuationRadarTool {
    pub renderer: Arc<dyn ChartRenderer>,
    pub charts_dir: PathBuf,
}

#[async_trait]
impl Tool for DrawValuationRadarTool {
    fn name(&self) -> &'static str {
        "draw_valuation_radar"
    }

    fn description(&self) -> &'static str {
        "Draw a five-axis valuation radar chart (growth, value, momentum, quality, sentiment) from analysis_data"
    }

    async fn execute(&self, input: &Value) -> Result<String> {
        let Some(record) = parse_record_input(input) else {
            return Ok("❌ 분석 데이터를 찾을 수 없습니다. analysis_data가 설정되지 않았습니다.".to_string());
        };

        let raw_path = input
            .get("output_path")
            .and_then(Value::as_str)
            .unwrap_or("valuation_radar.svg");
        let path = sanitize_output_path(raw_path, &self.charts_dir, CHART_EXTENSIONS, "svg");

        match self.renderer.render(ChartKind::Radar, &record, &path).await {
            Ok(saved) => Ok(format!(
                "✓ 레이더 차트가 {}에 저장되었습니다.",
                saved.display()
            )),
            Err(e) => {
                warn!("Radar rendering failed: {}", e);
                Ok(format!("차트 생성 중 오류 발생: {}", e))
            }
        }
    }
}

pub struct SaveReportToFileTool {
    pub sink: Arc<dyn ReportSink>,
    pub reports_dir: PathBuf,
}

#[async_trait]
impl Tool for SaveReportToFileTool {
    fn name(&self) -> &'static str {
        "save_report_to_file"
    }

    fn description(&self) -> &'static str {
        "Save the report text to a file (formats: txt, md; pdf is not supported)"
    }

    async fn execute(&self, input: &Value) -> Result<String> {
        let Some(report_text) = input.get("report_text").and_then(Value::as_str) else {
            return Ok("❌ 저장할 report_text가 없습니다.".to_string());
        };

        let format = match input
            .get("format")
            .and_then(Value::as_str)
            .unwrap_or("md")
            .parse::<ReportFormat>()
        {
            Ok(format) => format,
            Err(e) => return Ok(format!("❌ {}", e)),
        };

        let path = match input.get("output_path").and_then(Value::as_str) {
            Some(raw) => sanitize_output_path(raw, &self.reports_dir, REPORT_EXTENSIONS, format.extension()),
            None => {
                let timestamp = Local::now().format("%Y%m%d_%H%M%S");
                self.reports_dir
                    .join(format!("report_{}.{}", timestamp, format.extension()))
            }
        };

        let charts: Vec<String> = match input.get("chart_paths") {
            Some(Value::String(s)) => s
                .split(',')
                .map(|p| p.trim().to_string())
                .filter(|p| !p.is_empty())
                .collect(),
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(Value::as_str)
                .map(String::from)
                .collect(),
            _ => Vec::new(),
        };

        match self.sink.save(report_text, format, &path, &charts).await {
            Ok(saved) => Ok(format!("✓ 보고서가 {}에 저장되었습니다.", saved.display())),
            Err(e) => {
                warn!("Report save failed: {}", e);
                Ok(format!("❌ 파일 저장 중 오류 발생: {}", e))
            }
        }
    }
}

/// Clean a model-supplied output path.
///
/// The model occasionally appends JSON fragments, quotes or newlines to
/// the path, so everything after the first such character is cut. Parent
/// traversal and absolute paths are rejected; relative paths land under
/// `base_dir`.
pub(crate) fn sanitize_output_path(
    raw: &str,
    base_dir: &Path,
    allowed_extensions: &[&str],
    default_extension: &str,
) -> PathBuf {
    let cut = raw
        .find(['"', '}', ']', '\n', '\r'])
        .map(|idx| &raw[..idx])
        .unwrap_or(raw);
    let trimmed = cut.trim().trim_matches(['\'', '`']);

    let mut relative = PathBuf::new();
    for component in Path::new(trimmed).components() {
        if let std::path::Component::Normal(part) = component {
            relative.push(part);
        }
    }
    if relative.as_os_str().is_empty() {
        relative.push(format!("output.{}", default_extension));
    }

    let has_allowed_extension = relative
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| allowed_extensions.contains(&ext.to_lowercase().as_str()))
        .unwrap_or(false);
    if !has_allowed_extension {
        let mut name = relative.into_os_string();
        name.push(format!(".{}", default_extension));
        relative = PathBuf::from(name);
    }

    base_dir.join(relative)
}

/// Find a saved-file path inside a tool observation.
///
/// Observations attach Korean particles directly to the path ("...svg에
/// 저장..."), so the token is cut right after the file extension.
pub(crate) fn find_path_token(observation: &str, extensions: &[&str]) -> Option<String> {
    for token in observation.split_whitespace() {
        let token = token.trim_matches(['"', '\'', '(', ')']);
        for ext in extensions {
            let needle = format!(".{}", ext);
            if let Some(idx) = token.rfind(&needle) {
                return Some(token[..idx + needle.len()].to_string());
            }
        }
    }
    None
}
