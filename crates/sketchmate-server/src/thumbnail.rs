use std::io::Cursor;

use image::ImageFormat;

use crate::error::ServerError;

/// Downscale an image so its longest edge is at most `max_edge` pixels and
/// re-encode it as PNG. Aspect ratio is preserved; smaller images are not
/// enlarged.
pub fn make_thumbnail(image_bytes: &[u8], max_edge: u32) -> Result<Vec<u8>, ServerError> {
    let img = image::load_from_memory(image_bytes)
        .map_err(|e| ServerError::Image(format!("cannot decode image: {e}")))?;

    let thumb = if img.width() > max_edge || img.height() > max_edge {
        img.thumbnail(max_edge, max_edge)
    } else {
        img
    };

    let mut buf = Vec::new();
    thumb
        .write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
        .map_err(|e| ServerError::Image(format!("cannot encode thumbnail: {e}")))?;
    Ok(buf)
}

/// [`make_thumbnail`] on the blocking pool.
pub async fn make_thumbnail_async(image_bytes: Vec<u8>, max_edge: u32) -> Result<Vec<u8>, ServerError> {
    tokio::task::spawn_blocking(move || make_thumbnail(&image_bytes, max_edge))
        .await
        .map_err(|e| ServerError::Internal(format!("thumbnail task failed: {e}")))?
}

#[cfg(test)]
pub(crate) fn test_png(width: u32, height: u32) -> Vec<u8> {
    use image::{ImageBuffer, Rgb};
    let img: ImageBuffer<Rgb<u8>, Vec<u8>> =
        ImageBuffer::from_fn(width, height, |x, _| Rgb([(x % 255) as u8, 0, 0]));
    let mut buf = Vec::new();
    img.write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
        .unwrap();
    buf
}
