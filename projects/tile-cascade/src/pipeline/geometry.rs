use crate::pipeline::types::{BBox, Point, RotatedRect};
use geo::{Area, BooleanOps};
use geo_types::{LineString, Polygon};
use image::{DynamicImage, Rgb, RgbImage};
use imageproc::geometric_transformations::{warp_into, Interpolation, Projection};

/// Compute Intersection over Union between two `(x, y, w, h)` boxes
pub fn compute_iou(a: &BBox, b: &BBox) -> f64 {
    if a.area() <= 0.0 || b.area() <= 0.0 {
        return 0.0;
    }

    let x1 = a.x.max(b.x);
    let y1 = a.y.max(b.y);
    let x2 = a.right().min(b.right());
    let y2 = a.bottom().min(b.bottom());

    if x2 <= x1 || y2 <= y1 {
        return 0.0;
    }

    let intersection = (x2 - x1) * (y2 - y1);
    let union = a.area() + b.area() - intersection;

    if union <= 0.0 {
        0.0
    } else {
        intersection / union
    }
}

/// Corners of a rotated rectangle, in the order top-left, top-right, bottom-right,
/// bottom-left of the upright crop. The width axis points along `(cos a, sin a)`.
pub fn rotated_rect_to_quad(cx: f64, cy: f64, w: f64, h: f64, angle: f64) -> [Point; 4] {
    let (s, c) = angle.sin_cos();
    let (ux, uy) = (c * w / 2.0, s * w / 2.0);
    let (vx, vy) = (-s * h / 2.0, c * h / 2.0);
    [
        Point { x: cx - ux - vx, y: cy - uy - vy },
        Point { x: cx + ux - vx, y: cy + uy - vy },
        Point { x: cx + ux + vx, y: cy + uy + vy },
        Point { x: cx - ux + vx, y: cy - uy + vy },
    ]
}

fn to_geo_polygon(points: &[Point]) -> Polygon<f64> {
    let coords: Vec<(f64, f64)> = points.iter().map(|p| (p.x, p.y)).collect();
    Polygon::new(LineString::from(coords), vec![])
}

/// Polygon IoU of two rotated rectangles
pub fn rotated_iou(a: &RotatedRect, b: &RotatedRect) -> f64 {
    if a.area() <= 0.0 || b.area() <= 0.0 {
        return 0.0;
    }

    let pa = to_geo_polygon(&rotated_rect_to_quad(a.cx, a.cy, a.w, a.h, a.angle));
    let pb = to_geo_polygon(&rotated_rect_to_quad(b.cx, b.cy, b.w, b.h, b.angle));

    let intersection = pa.intersection(&pb).unsigned_area();
    let union = a.area() + b.area() - intersection;

    if union <= 0.0 {
        0.0
    } else {
        (intersection / union).clamp(0.0, 1.0)
    }
}

/// Integer `(left, top, width, height)` of the region between two corners. The far
/// corner is pushed to at least one pixel past the near one, then both are clamped
/// to the image. `None` when nothing is left.
pub fn clamp_crop_region(
    img_w: u32,
    img_h: u32,
    x1: f64,
    y1: f64,
    x2: f64,
    y2: f64,
) -> Option<(u32, u32, u32, u32)> {
    let (img_w, img_h) = (img_w as i64, img_h as i64);

    let x1 = x1.floor() as i64;
    let y1 = y1.floor() as i64;
    let x2 = (x2.ceil() as i64).max(x1 + 1);
    let y2 = (y2.ceil() as i64).max(y1 + 1);

    let left = x1.clamp(0, img_w);
    let top = y1.clamp(0, img_h);
    let right = x2.clamp(0, img_w);
    let bottom = y2.clamp(0, img_h);

    if right <= left || bottom <= top {
        return None;
    }
    Some((
        left as u32,
        top as u32,
        (right - left) as u32,
        (bottom - top) as u32,
    ))
}

pub fn crop_axis_aligned(
    image: &DynamicImage,
    x1: f64,
    y1: f64,
    x2: f64,
    y2: f64,
) -> Option<DynamicImage> {
    let (left, top, w, h) = clamp_crop_region(image.width(), image.height(), x1, y1, x2, y2)?;
    Some(image.crop_imm(left, top, w, h))
}

/// Forward (source to crop) affine matrix: rotation about the rect centre by `angle`
/// degrees, then a shift that moves the centre to the middle of a `w x h` output.
fn rotation_matrix(cx: f64, cy: f64, angle_deg: f64, w: f64, h: f64) -> [f32; 9] {
    let (beta, alpha) = angle_deg.to_radians().sin_cos();
    let tx = (1.0 - alpha) * cx - beta * cy + (w / 2.0 - cx);
    let ty = beta * cx + (1.0 - alpha) * cy + (h / 2.0 - cy);
    [
        alpha as f32,
        beta as f32,
        tx as f32,
        -beta as f32,
        alpha as f32,
        ty as f32,
        0.0,
        0.0,
        1.0,
    ]
}

/// Upright `w x h` crop of a rotated rectangle, sampled nearest-neighbour.
///
/// Sides longer than the source diagonal cannot hold any source pixel along their
/// full length and are refused, as are empty or non-finite sides.
pub fn crop_rotated(image: &DynamicImage, rect: &RotatedRect) -> Option<DynamicImage> {
    let w = rect.w.round();
    let h = rect.h.round();
    let diagonal = (image.width() as f64).hypot(image.height() as f64).ceil();
    let fits = |side: f64| side.is_finite() && (1.0..=diagonal).contains(&side);
    if !fits(w) || !fits(h) {
        return None;
    }

    let matrix = rotation_matrix(rect.cx, rect.cy, rect.angle.to_degrees(), w, h);
    let projection = Projection::from_matrix(matrix)?;

    let converted;
    let src = match image.as_rgb8() {
        Some(buffer) => buffer,
        None => {
            converted = image.to_rgb8();
            &converted
        }
    };

    let mut out = RgbImage::new(w as u32, h as u32);
    warp_into(
        src,
        &projection,
        Interpolation::Nearest,
        Rgb([0, 0, 0]),
        &mut out,
    );
    Some(DynamicImage::ImageRgb8(out))
}
