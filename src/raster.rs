//! # Rasterizer
//!
//! Executes a [`RenderPlan`] on real pixels: decode the source frame, crop,
//! scale, blur under a cached polygon mask, draw the overlays and encode the
//! total and detail JPEGs.
//!
//! Overlays are drawn with `embedded-graphics` through [`Canvas`], a
//! `DrawTarget` over an `image::RgbImage`.

use crate::composition::{FontSize, Overlay, RenderPlan, SourceImage, Tint};
use crate::params::{PixelRect, Resolution};
use embedded_graphics::{
    mono_font::{
        iso_8859_1::{FONT_5X8, FONT_6X10, FONT_6X13_BOLD},
        MonoFont, MonoTextStyle,
    },
    pixelcolor::Rgb888,
    prelude::*,
    primitives::{PrimitiveStyle, PrimitiveStyleBuilder, Rectangle, StrokeAlignment},
    text::{Baseline, Text},
};
use image::codecs::jpeg::JpegEncoder;
use image::imageops::{self, FilterType};
use image::{GrayImage, Luma, Rgb, RgbImage};
use std::convert::Infallible;
use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

const OUTLINE_WIDTH: u32 = 2;

#[derive(Error, Debug)]
pub enum RasterError {
    #[error("image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("raster IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("{what} {rect:?} outside {width}x{height}")]
    OutOfBounds {
        what: &'static str,
        rect: PixelRect,
        width: u32,
        height: u32,
    },
}

/// Turns a render plan into the published image pair.
pub trait Rasterizer {
    /// `live` is the frame just captured; it is only read when the plan's
    /// source is [`SourceImage::Live`].
    fn render(&mut self, plan: &RenderPlan, live: &Path) -> Result<(), RasterError>;
}

/// Where the rasterizer reads placeholders and writes outputs.
#[derive(Debug, Clone)]
pub struct RasterPaths {
    pub offline: PathBuf,
    pub cloudy_night: PathBuf,
    pub total: PathBuf,
    pub detail: PathBuf,
}

pub struct ImageRasterizer {
    paths: RasterPaths,
    sensor: Resolution,
    quality: u8,
}

impl ImageRasterizer {
    pub fn new(paths: RasterPaths, sensor: Resolution, quality: u8) -> Self {
        ImageRasterizer {
            paths,
            sensor,
            quality: quality.clamp(1, 100),
        }
    }

    fn load_source(&self, source: SourceImage, live: &Path) -> Result<RgbImage, RasterError> {
        let path = match source {
            SourceImage::Live => live,
            SourceImage::Offline => self.paths.offline.as_path(),
            SourceImage::CloudyNight => self.paths.cloudy_night.as_path(),
        };
        let image = image::open(path)?.to_rgb8();
        if source != SourceImage::Live && image.dimensions() != (self.sensor.width, self.sensor.height)
        {
            debug!(
                "Scaling placeholder {} to {}x{}",
                path.display(),
                self.sensor.width,
                self.sensor.height
            );
            return Ok(imageops::resize(
                &image,
                self.sensor.width,
                self.sensor.height,
                FilterType::Triangle,
            ));
        }
        Ok(image)
    }
}

impl Rasterizer for ImageRasterizer {
    fn render(&mut self, plan: &RenderPlan, live: &Path) -> Result<(), RasterError> {
        let source = self.load_source(plan.source, live)?;
        let crop = cut(&source, &plan.crop, "crop")?;

        if plan.refresh_total {
            let mut total = imageops::resize(
                &crop,
                plan.total_size.width,
                plan.total_size.height,
                FilterType::Triangle,
            );
            if let Some(blur) = &plan.blur {
                let mask = load_or_create_mask(&blur.mask_path, &blur.polygon, plan.total_size)?;
                blur_under_mask(&mut total, &mask, blur.radius);
            }
            draw_overlays(&mut total, &plan.overlays);
            save_jpeg(&total, &self.paths.total, self.quality)?;
        }

        if plan.refresh_detail {
            let zoom = cut(&crop, &plan.zoom, "zoom")?;
            let detail = imageops::resize(
                &zoom,
                plan.detail_size.width,
                plan.detail_size.height,
                FilterType::Triangle,
            );
            save_jpeg(&detail, &self.paths.detail, self.quality)?;
        }

        info!(
            "Rendered {:?} source (total {}, detail {})",
            plan.source, plan.refresh_total, plan.refresh_detail
        );
        Ok(())
    }
}

fn cut(image: &RgbImage, rect: &PixelRect, what: &'static str) -> Result<RgbImage, RasterError> {
    let (width, height) = image.dimensions();
    let inside = rect.x >= 0
        && rect.y >= 0
        && rect.width > 0
        && rect.height > 0
        && rect.right() as i64 <= width as i64
        && rect.bottom() as i64 <= height as i64;
    if !inside {
        return Err(RasterError::OutOfBounds {
            what,
            rect: *rect,
            width,
            height,
        });
    }
    Ok(imageops::crop_imm(image, rect.x as u32, rect.y as u32, rect.width, rect.height).to_image())
}

/// Write through a sibling temp file so a transfer never reads a half-written
/// image.
fn save_jpeg(image: &RgbImage, path: &Path, quality: u8) -> Result<(), RasterError> {
    let tmp = path.with_extension("jpg.tmp");
    {
        let mut writer = BufWriter::new(File::create(&tmp)?);
        JpegEncoder::new_with_quality(&mut writer, quality).encode_image(image)?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

// -- Blur --

/// Reuse the mask at `path` when it exists with the right size, otherwise
/// rasterize the polygon and store it.
fn load_or_create_mask(
    path: &Path,
    polygon: &[(i32, i32)],
    size: Resolution,
) -> Result<GrayImage, RasterError> {
    if path.exists() {
        match image::open(path) {
            Ok(existing) if existing.width() == size.width && existing.height() == size.height => {
                return Ok(existing.to_luma8());
            }
            Ok(_) => debug!("Mask {} has the wrong size, regenerating", path.display()),
            Err(e) => debug!("Mask {} unreadable ({}), regenerating", path.display(), e),
        }
    }
    let mask = polygon_mask(polygon, size);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    mask.save(path)?;
    info!("Created blur mask {}", path.display());
    Ok(mask)
}

/// Even-odd scanline fill of `polygon`, 255 inside and 0 outside.
pub fn polygon_mask(polygon: &[(i32, i32)], size: Resolution) -> GrayImage {
    let mut mask = GrayImage::new(size.width, size.height);
    if polygon.len() < 3 {
        return mask;
    }
    let mut crossings = Vec::with_capacity(polygon.len());
    for y in 0..size.height {
        let scan = y as f64 + 0.5;
        crossings.clear();
        for (i, &(x1, y1)) in polygon.iter().enumerate() {
            let (x2, y2) = polygon[(i + 1) % polygon.len()];
            let (y1, y2, x1, x2) = (y1 as f64, y2 as f64, x1 as f64, x2 as f64);
            if (y1 <= scan && scan < y2) || (y2 <= scan && scan < y1) {
                crossings.push(x1 + (scan - y1) * (x2 - x1) / (y2 - y1));
            }
        }
        crossings.sort_by(|a, b| a.total_cmp(b));
        for pair in crossings.chunks_exact(2) {
            let start = pair[0].round().max(0.0) as u32;
            let end = (pair[1].round().max(0.0) as u32).min(size.width);
            for x in start..end {
                mask.put_pixel(x, y, Luma([255]));
            }
        }
    }
    mask
}

fn blur_under_mask(image: &mut RgbImage, mask: &GrayImage, radius: f32) {
    let blurred = imageops::blur(&*image, radius);
    for (x, y, pixel) in image.enumerate_pixels_mut() {
        if mask.get_pixel(x, y)[0] > 127 {
            *pixel = *blurred.get_pixel(x, y);
        }
    }
}

// -- Overlays --

/// `DrawTarget` over an RGB image; pixels outside the image are dropped.
pub struct Canvas<'a>(pub &'a mut RgbImage);

impl OriginDimensions for Canvas<'_> {
    fn size(&self) -> Size {
        Size::new(self.0.width(), self.0.height())
    }
}

impl DrawTarget for Canvas<'_> {
    type Color = Rgb888;
    type Error = Infallible;

    fn draw_iter<I>(&mut self, pixels: I) -> Result<(), Self::Error>
    where
        I: IntoIterator<Item = Pixel<Self::Color>>,
    {
        let (width, height) = self.0.dimensions();
        for Pixel(point, color) in pixels {
            if point.x >= 0 && point.y >= 0 && (point.x as u32) < width && (point.y as u32) < height
            {
                self.0
                    .put_pixel(point.x as u32, point.y as u32, Rgb([color.r(), color.g(), color.b()]));
            }
        }
        Ok(())
    }
}

fn color(tint: Tint) -> Rgb888 {
    match tint {
        Tint::White => Rgb888::WHITE,
        Tint::Black => Rgb888::BLACK,
        Tint::Gray => Rgb888::new(128, 128, 128),
    }
}

fn font(size: FontSize) -> &'static MonoFont<'static> {
    match size {
        FontSize::Small => &FONT_5X8,
        FontSize::Regular => &FONT_6X10,
        FontSize::Bold => &FONT_6X13_BOLD,
    }
}

fn bounds(rect: &PixelRect) -> Rectangle {
    Rectangle::new(Point::new(rect.x, rect.y), Size::new(rect.width, rect.height))
}

/// Paint overlays in plan order.
pub fn draw_overlays(image: &mut RgbImage, overlays: &[Overlay]) {
    let mut canvas = Canvas(image);
    for overlay in overlays {
        let drawn = match overlay {
            Overlay::Panel { rect, tint } => bounds(rect)
                .into_styled(PrimitiveStyle::with_fill(color(*tint)))
                .draw(&mut canvas),
            Overlay::Outline { rect, tint } => bounds(rect)
                .into_styled(
                    PrimitiveStyleBuilder::new()
                        .stroke_color(color(*tint))
                        .stroke_width(OUTLINE_WIDTH)
                        .stroke_alignment(StrokeAlignment::Inside)
                        .build(),
                )
                .draw(&mut canvas),
            Overlay::Text {
                x,
                y,
                text,
                tint,
                font: size,
            } => Text::with_baseline(
                text,
                Point::new(*x, *y),
                MonoTextStyle::new(font(*size), color(*tint)),
                Baseline::Top,
            )
            .draw(&mut canvas)
            .map(|_| ()),
        };
        drawn.unwrap_or_else(|never| match never {});
    }
}
