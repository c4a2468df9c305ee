//! GPX track adapter
//!
//! Streams the document with quick-xml and collects `<trkpt>` elements from
//! every track and segment in document order. Files without track points fall
//! back to `<rtept>`. Heart rate and speed are read from `<extensions>` under
//! any namespace prefix (Garmin TrackPointExtension and similar).

use chrono::{DateTime, Duration, Utc};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

use super::{ParsedTrack, TrackFileAdapter};
use crate::error::EngineError;
use crate::types::{RawSample, SourceFormat};

type Result<T> = std::result::Result<T, EngineError>;

/// GPX file adapter
pub struct GpxAdapter;

impl TrackFileAdapter for GpxAdapter {
    fn format(&self) -> SourceFormat {
        SourceFormat::Gpx
    }

    fn parse(&self, bytes: &[u8]) -> Result<ParsedTrack> {
        let xml = std::str::from_utf8(bytes)
            .map_err(|e| EngineError::MalformedInput(format!("GPX is not valid UTF-8: {e}")))?;
        parse_gpx(xml)
    }
}

/// A point as written in the file, before missing timestamps are filled
#[derive(Debug, Default)]
struct GpxPoint {
    lat: f64,
    lon: f64,
    ele: Option<f64>,
    time: Option<DateTime<Utc>>,
    speed: Option<f64>,
    heart_rate: Option<f64>,
}

/// Parse a GPX document into raw samples.
pub fn parse_gpx(xml: &str) -> Result<ParsedTrack> {
    let mut reader = Reader::from_str(xml);
    let mut saw_root = false;
    let mut name: Option<String> = None;
    let mut metadata_name: Option<String> = None;
    let mut track_points = Vec::new();
    let mut route_points = Vec::new();

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"gpx" => saw_root = true,
                b"metadata" => metadata_name = parse_metadata(&mut reader)?,
                b"trk" => parse_track(&mut reader, &mut track_points, &mut name)?,
                b"rte" => parse_route(&mut reader, &mut route_points)?,
                b"wpt" => skip_element(&mut reader, &e)?,
                _ => {}
            },
            Ok(Event::Empty(e)) if e.local_name().as_ref() == b"gpx" => saw_root = true,
            Ok(Event::Eof) => break,
            Err(e) => return Err(xml_error(e)),
            _ => {}
        }
    }

    if !saw_root {
        return Err(EngineError::MalformedInput(
            "missing <gpx> root element".to_string(),
        ));
    }

    let points = if track_points.is_empty() {
        route_points
    } else {
        track_points
    };

    if points.is_empty() {
        return Err(EngineError::MalformedInput(
            "GPX contains no track or route points".to_string(),
        ));
    }

    Ok(ParsedTrack {
        name: name.or(metadata_name),
        samples: fill_timestamps(points),
    })
}

/// Convert file points to samples, giving untimed points the previous time + 1s
fn fill_timestamps(points: Vec<GpxPoint>) -> Vec<RawSample> {
    let mut previous: Option<DateTime<Utc>> = None;

    points
        .into_iter()
        .map(|p| {
            let timestamp = p.time.unwrap_or_else(|| match previous {
                Some(t) => t + Duration::seconds(1),
                None => DateTime::<Utc>::default(),
            });
            previous = Some(timestamp);

            RawSample {
                latitude: p.lat,
                longitude: p.lon,
                elevation: p.ele,
                timestamp,
                speed: p.speed,
                heart_rate: p.heart_rate,
                accuracy: None,
            }
        })
        .collect()
}

fn xml_error(e: quick_xml::Error) -> EngineError {
    EngineError::MalformedInput(format!("XML parse error: {e}"))
}

fn unexpected_eof(element: &str) -> EngineError {
    EngineError::MalformedInput(format!("unexpected end of file inside <{element}>"))
}

fn skip_element<'a>(reader: &mut Reader<&'a [u8]>, start: &BytesStart<'_>) -> Result<()> {
    reader.read_to_end(start.name()).map_err(xml_error)?;
    Ok(())
}

/// Parse a `<metadata>` element, returning its name.
fn parse_metadata<'a>(reader: &mut Reader<&'a [u8]>) -> Result<Option<String>> {
    let mut name = None;
    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"name" => name = Some(read_text_owned(reader, &e)?),
                _ => skip_element(reader, &e)?,
            },
            Ok(Event::End(e)) if e.local_name().as_ref() == b"metadata" => break,
            Ok(Event::Eof) => return Err(unexpected_eof("metadata")),
            Err(e) => return Err(xml_error(e)),
            _ => {}
        }
    }
    Ok(name)
}

/// Parse a `<trk>` element, appending its points.
fn parse_track<'a>(
    reader: &mut Reader<&'a [u8]>,
    points: &mut Vec<GpxPoint>,
    name: &mut Option<String>,
) -> Result<()> {
    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"name" => {
                    let text = read_text_owned(reader, &e)?;
                    if name.is_none() && !text.trim().is_empty() {
                        *name = Some(text.trim().to_string());
                    }
                }
                b"trkseg" => parse_point_list(reader, b"trkseg", b"trkpt", points)?,
                _ => skip_element(reader, &e)?,
            },
            Ok(Event::End(e)) if e.local_name().as_ref() == b"trk" => break,
            Ok(Event::Eof) => return Err(unexpected_eof("trk")),
            Err(e) => return Err(xml_error(e)),
            _ => {}
        }
    }
    Ok(())
}

/// Parse a `<rte>` element, appending its points.
fn parse_route<'a>(reader: &mut Reader<&'a [u8]>, points: &mut Vec<GpxPoint>) -> Result<()> {
    parse_point_list(reader, b"rte", b"rtept", points)
}

/// Parse the children of a container (`<trkseg>` or `<rte>`), collecting
/// elements named `point_tag`.
fn parse_point_list<'a>(
    reader: &mut Reader<&'a [u8]>,
    container: &[u8],
    point_tag: &[u8],
    points: &mut Vec<GpxPoint>,
) -> Result<()> {
    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                if e.local_name().as_ref() == point_tag {
                    points.push(parse_point(&e, reader)?);
                } else {
                    skip_element(reader, &e)?;
                }
            }
            Ok(Event::Empty(e)) if e.local_name().as_ref() == point_tag => {
                let (lat, lon) = parse_lat_lon(&e)?;
                points.push(GpxPoint {
                    lat,
                    lon,
                    ..Default::default()
                });
            }
            Ok(Event::End(e)) if e.local_name().as_ref() == container => break,
            Ok(Event::Eof) => {
                return Err(unexpected_eof(&String::from_utf8_lossy(container)));
            }
            Err(e) => return Err(xml_error(e)),
            _ => {}
        }
    }
    Ok(())
}

/// Parse lat/lon attributes from a point element's start tag.
fn parse_lat_lon(e: &BytesStart<'_>) -> Result<(f64, f64)> {
    let mut lat: Option<f64> = None;
    let mut lon: Option<f64> = None;

    for attr_result in e.attributes() {
        let attr = attr_result
            .map_err(|e| EngineError::MalformedInput(format!("bad attribute: {e}")))?;
        let val = std::str::from_utf8(&attr.value).unwrap_or_default();
        match attr.key.local_name().as_ref() {
            b"lat" => lat = Some(parse_number("lat", val)?),
            b"lon" => lon = Some(parse_number("lon", val)?),
            _ => {}
        }
    }

    let lat = lat.ok_or_else(|| {
        EngineError::MalformedInput("point is missing the lat attribute".to_string())
    })?;
    let lon = lon.ok_or_else(|| {
        EngineError::MalformedInput("point is missing the lon attribute".to_string())
    })?;

    Ok((lat, lon))
}

fn parse_number(field: &str, text: &str) -> Result<f64> {
    text.trim()
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .ok_or_else(|| EngineError::MalformedInput(format!("invalid {field} value '{text}'")))
}

fn parse_time(text: &str) -> Result<DateTime<Utc>> {
    let trimmed = text.trim();
    DateTime::parse_from_rfc3339(trimmed)
        .map(|t| t.with_timezone(&Utc))
        .or_else(|_| trimmed.parse::<DateTime<Utc>>())
        .map_err(|_| EngineError::MalformedInput(format!("invalid time value '{trimmed}'")))
}

/// Parse a point element and its children, including nested extensions.
/// Called after receiving Event::Start for the point element.
fn parse_point<'a>(start: &BytesStart<'a>, reader: &mut Reader<&'a [u8]>) -> Result<GpxPoint> {
    let (lat, lon) = parse_lat_lon(start)?;
    let mut point = GpxPoint {
        lat,
        lon,
        ..Default::default()
    };
    let end_name = start.name().0.to_vec();

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"ele" => {
                    // Blank or unparsable elevation is treated as absent
                    point.ele = read_text_owned(reader, &e)?
                        .trim()
                        .parse::<f64>()
                        .ok()
                        .filter(|v| v.is_finite());
                }
                b"time" => point.time = Some(parse_time(&read_text_owned(reader, &e)?)?),
                b"speed" => {
                    point.speed = read_text_owned(reader, &e)?.trim().parse::<f64>().ok();
                }
                b"hr" | b"heartrate" => {
                    point.heart_rate = read_text_owned(reader, &e)?.trim().parse::<f64>().ok();
                }
                // Descend into extensions and other wrappers
                _ => {}
            },
            Ok(Event::End(e)) if e.name().0 == end_name.as_slice() => break,
            Ok(Event::Eof) => return Err(unexpected_eof("trkpt")),
            Err(e) => return Err(xml_error(e)),
            _ => {}
        }
    }

    Ok(point)
}

/// Read text content of an element as an owned String.
/// Handles regular text, CDATA sections, and entity references (Event::GeneralRef).
fn read_text_owned<'a>(reader: &mut Reader<&'a [u8]>, start: &BytesStart<'_>) -> Result<String> {
    let end_name = start.name().0.to_vec();
    let mut text = String::new();

    loop {
        match reader.read_event() {
            Ok(Event::Text(e)) => {
                text.push_str(std::str::from_utf8(e.as_ref()).unwrap_or_default());
            }
            Ok(Event::CData(e)) => {
                text.push_str(std::str::from_utf8(e.as_ref()).unwrap_or_default());
            }
            Ok(Event::GeneralRef(e)) => {
                if let Ok(Some(ch)) = e.resolve_char_ref() {
                    text.push(ch);
                } else {
                    match std::str::from_utf8(e.as_ref()).unwrap_or_default() {
                        "amp" => text.push('&'),
                        "lt" => text.push('<'),
                        "gt" => text.push('>'),
                        "quot" => text.push('"'),
                        "apos" => text.push('\''),
                        _ => {}
                    }
                }
            }
            Ok(Event::End(e)) if e.name().0 == end_name.as_slice() => break,
            Ok(Event::Eof) => {
                return Err(unexpected_eof(&String::from_utf8_lossy(&end_name)));
            }
            Err(e) => return Err(xml_error(e)),
            _ => {}
        }
    }

    Ok(text)
}
