//! Pushes a synthetic test pattern into a server-owned source and serves
//! it over the wire — the way an embedding process that captures frames
//! itself (rather than a remote client pushing them in) drives the
//! broker directly.
//!
//! Drives a synthetic frame generator through [`Source::send_frame`]
//! against the crate's built-in `raw` codec; source/stream wiring is a
//! general verb surface rather than one stream nailed to the server at
//! startup.

use std::sync::Arc;
use std::{thread, time::Duration};

use image::{ImageBuffer, Rgb};
use imageproc::drawing::draw_text_mut;
use rusttype::{Font, Scale};
use svr::{FrameProperties, RawFrame, SampleDepth, Server};

const FONT: &[u8] = include_bytes!("/usr/share/fonts/truetype/dejavu/DejaVuSansMono.ttf");

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let width = 640u32;
    let height = 480u32;
    let props = FrameProperties::new(width, height, SampleDepth::U8, 3);

    let server = Server::new();
    let source = server.open_source("test")?;
    source.set_frame_properties(props)?;
    source.set_encoding("raw", &server.router().registries().codecs)?;

    let producer_server = server.clone();
    let producer_source = source.clone();
    thread::spawn(move || {
        let font = Font::try_from_bytes(FONT).expect("embedded font is valid");
        let mut frame_number: u64 = 0;
        loop {
            let mut imgbuf = ImageBuffer::<Rgb<u8>, Vec<u8>>::from_fn(width, height, |_, _| {
                Rgb([0, 0, 0])
            });
            draw_text_mut(
                &mut imgbuf,
                Rgb([255, 255, 255]),
                0,
                0,
                Scale { x: 100.0, y: 100.0 },
                &font,
                &frame_number.to_string(),
            );
            let frame = RawFrame::new(props, Arc::new(imgbuf.into_raw()));
            let registries = producer_server.router().registries();
            if let Err(e) = producer_source.send_frame(frame, &registries.streams, &registries.natives) {
                eprintln!("send_frame failed: {e}");
            }
            thread::sleep(Duration::from_millis(100));
            frame_number += 1;
        }
    });

    server.serve("127.0.0.1:3001").await?;
    Ok(())
}
