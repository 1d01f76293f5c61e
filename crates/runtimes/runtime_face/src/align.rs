//! Five-point face alignment onto the 112x112 recognition template

use image::{Rgb, RgbImage};

/// Side of the aligned crop fed to the recognizer
pub const ALIGNED_SIZE: u32 = 112;

/// Landmark template of an aligned face: eyes, nose tip, mouth corners
pub const ARCFACE_TEMPLATE: [(f32, f32); 5] = [
    (38.2946, 51.6963),
    (73.5318, 51.5014),
    (56.0252, 71.7366),
    (41.5493, 92.3655),
    (70.7299, 92.2041),
];

/// 2x3 affine matrix mapping source pixels to destination pixels
pub type Affine = [[f32; 3]; 2];

/// Least-squares similarity transform (rotation, uniform scale, translation)
/// taking `src` onto `dst`. Reflections are never produced.
pub fn estimate_similarity(src: &[(f32, f32); 5], dst: &[(f32, f32); 5]) -> Affine {
    let n = src.len() as f32;
    let mean = |points: &[(f32, f32); 5]| {
        let (sx, sy) = points
            .iter()
            .fold((0.0, 0.0), |(ax, ay), (x, y)| (ax + x, ay + y));
        (sx / n, sy / n)
    };
    let (src_cx, src_cy) = mean(src);
    let (dst_cx, dst_cy) = mean(dst);

    // With points as complex numbers the optimal scale * rotation is
    // sum(conj(s) * d) / sum(|s|^2) over the centered sets.
    let mut dot = 0.0f32;
    let mut cross = 0.0f32;
    let mut var = 0.0f32;
    for (s, d) in src.iter().zip(dst.iter()) {
        let (sx, sy) = (s.0 - src_cx, s.1 - src_cy);
        let (dx, dy) = (d.0 - dst_cx, d.1 - dst_cy);
        dot += sx * dx + sy * dy;
        cross += sx * dy - sy * dx;
        var += sx * sx + sy * sy;
    }

    let (a, b) = if var > f32::EPSILON {
        (dot / var, cross / var)
    } else {
        (1.0, 0.0)
    };

    let tx = dst_cx - (a * src_cx - b * src_cy);
    let ty = dst_cy - (b * src_cx + a * src_cy);
    [[a, -b, tx], [b, a, ty]]
}

/// Warp `image` through `transform` into a `size` x `size` crop.
/// Bilinear sampling; pixels mapping outside the source stay black.
pub fn warp_affine(image: &RgbImage, transform: &Affine, size: u32) -> RgbImage {
    let mut output = RgbImage::from_pixel(size, size, Rgb([0, 0, 0]));

    let [[m00, m01, tx], [m10, m11, ty]] = *transform;
    let det = m00 * m11 - m01 * m10;
    if det.abs() < f32::EPSILON || image.width() < 2 || image.height() < 2 {
        return output;
    }
    let inv = [[m11 / det, -m01 / det], [-m10 / det, m00 / det]];
    let (max_x, max_y) = ((image.width() - 1) as f32, (image.height() - 1) as f32);

    for (x, y, pixel) in output.enumerate_pixels_mut() {
        let dx = x as f32 - tx;
        let dy = y as f32 - ty;
        let src_x = inv[0][0] * dx + inv[0][1] * dy;
        let src_y = inv[1][0] * dx + inv[1][1] * dy;
        if src_x < 0.0 || src_y < 0.0 || src_x > max_x || src_y > max_y {
            continue;
        }

        let x0 = (src_x.floor() as u32).min(image.width() - 2);
        let y0 = (src_y.floor() as u32).min(image.height() - 2);
        let fx = src_x - x0 as f32;
        let fy = src_y - y0 as f32;

        let p00 = image.get_pixel(x0, y0);
        let p10 = image.get_pixel(x0 + 1, y0);
        let p01 = image.get_pixel(x0, y0 + 1);
        let p11 = image.get_pixel(x0 + 1, y0 + 1);

        for c in 0..3 {
            let v = p00[c] as f32 * (1.0 - fx) * (1.0 - fy)
                + p10[c] as f32 * fx * (1.0 - fy)
                + p01[c] as f32 * (1.0 - fx) * fy
                + p11[c] as f32 * fx * fy;
            pixel[c] = v.round().clamp(0.0, 255.0) as u8;
        }
    }

    output
}

/// Crop the face described by `landmarks` onto the recognition template
pub fn align_face(image: &RgbImage, landmarks: &[(f32, f32); 5]) -> RgbImage {
    let transform = estimate_similarity(landmarks, &ARCFACE_TEMPLATE);
    warp_affine(image, &transform, ALIGNED_SIZE)
}
