//! SpatiaLite BLOB geometries and their GeoJSON rendering.
//!
//! Layout: `0x00`, endian flag, SRID, MBR (four doubles), `0x7C`, class
//! code, body, `0xFE`. Collection members are prefixed with `0x69`.
//! Class codes carry the dimension in the thousands (`+1000` Z, `+2000` M,
//! `+3000` ZM) and the compressed LineString/Polygon encodings add
//! `1_000_000`.

use crate::config::GeoJsonOptions;
use crate::error::{Error, Result};
use crate::value::Value;
use std::fmt::Write;

const BLOB_START: u8 = 0x00;
const BLOB_END: u8 = 0xFE;
const MBR_END: u8 = 0x7C;
const ENTITY: u8 = 0x69;
const LITTLE_ENDIAN: u8 = 0x01;
const BIG_ENDIAN: u8 = 0x00;
const HEADER_LEN: usize = 43;
const COMPRESSED: i32 = 1_000_000;

const POINT: i32 = 1;
const LINESTRING: i32 = 2;
const POLYGON: i32 = 3;
const MULTIPOINT: i32 = 4;
const MULTILINESTRING: i32 = 5;
const MULTIPOLYGON: i32 = 6;
const COLLECTION: i32 = 7;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Dims {
    Xy,
    Xyz,
    Xym,
    Xyzm,
}

impl Dims {
    fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(Dims::Xy),
            1 => Some(Dims::Xyz),
            2 => Some(Dims::Xym),
            3 => Some(Dims::Xyzm),
            _ => None,
        }
    }

    fn has_z(self) -> bool {
        matches!(self, Dims::Xyz | Dims::Xyzm)
    }

    fn has_m(self) -> bool {
        matches!(self, Dims::Xym | Dims::Xyzm)
    }
}

/// A coordinate as rendered; M ordinates are read and discarded.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Coord {
    pub x: f64,
    pub y: f64,
    pub z: Option<f64>,
}

impl Coord {
    pub fn xy(x: f64, y: f64) -> Self {
        Self { x, y, z: None }
    }

    pub fn xyz(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z: Some(z) }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Shape {
    Point(Coord),
    LineString(Vec<Coord>),
    Polygon(Vec<Vec<Coord>>),
    MultiPoint(Vec<Coord>),
    MultiLineString(Vec<Vec<Coord>>),
    MultiPolygon(Vec<Vec<Vec<Coord>>>),
    GeometryCollection(Vec<Shape>),
}

impl Shape {
    fn type_name(&self) -> &'static str {
        match self {
            Shape::Point(_) => "Point",
            Shape::LineString(_) => "LineString",
            Shape::Polygon(_) => "Polygon",
            Shape::MultiPoint(_) => "MultiPoint",
            Shape::MultiLineString(_) => "MultiLineString",
            Shape::MultiPolygon(_) => "MultiPolygon",
            Shape::GeometryCollection(_) => "GeometryCollection",
        }
    }

    fn class(&self) -> i32 {
        match self {
            Shape::Point(_) => POINT,
            Shape::LineString(_) => LINESTRING,
            Shape::Polygon(_) => POLYGON,
            Shape::MultiPoint(_) => MULTIPOINT,
            Shape::MultiLineString(_) => MULTILINESTRING,
            Shape::MultiPolygon(_) => MULTIPOLYGON,
            Shape::GeometryCollection(_) => COLLECTION,
        }
    }

    fn coords(&self) -> Box<dyn Iterator<Item = &Coord> + '_> {
        match self {
            Shape::Point(point) => Box::new(std::iter::once(point)),
            Shape::LineString(points) | Shape::MultiPoint(points) => Box::new(points.iter()),
            Shape::Polygon(rings) | Shape::MultiLineString(rings) => {
                Box::new(rings.iter().flatten())
            }
            Shape::MultiPolygon(polygons) => Box::new(polygons.iter().flatten().flatten()),
            Shape::GeometryCollection(members) => Box::new(members.iter().flat_map(Shape::coords)),
        }
    }
}

/// A decoded SpatiaLite geometry.
#[derive(Clone, Debug, PartialEq)]
pub struct Geometry {
    pub srid: i32,
    /// `[minx, miny, maxx, maxy]` as stored in the blob header.
    pub mbr: [f64; 4],
    pub shape: Shape,
}

impl Geometry {
    /// Builds a geometry, computing its MBR from the coordinates.
    pub fn new(srid: i32, shape: Shape) -> Self {
        let mut mbr = [f64::INFINITY, f64::INFINITY, f64::NEG_INFINITY, f64::NEG_INFINITY];
        for coord in shape.coords() {
            mbr[0] = mbr[0].min(coord.x);
            mbr[1] = mbr[1].min(coord.y);
            mbr[2] = mbr[2].max(coord.x);
            mbr[3] = mbr[3].max(coord.y);
        }
        if mbr[0] > mbr[2] {
            mbr = [0.0; 4];
        }
        Self { srid, mbr, shape }
    }

    pub fn is_geometry(blob: &[u8]) -> bool {
        Self::parse(blob).is_some()
    }

    /// `None` when the blob is not a well-formed SpatiaLite geometry.
    pub fn parse(blob: &[u8]) -> Option<Self> {
        if blob.len() < HEADER_LEN + 1
            || blob[0] != BLOB_START
            || blob[38] != MBR_END
            || blob[blob.len() - 1] != BLOB_END
        {
            return None;
        }
        let little = match blob[1] {
            LITTLE_ENDIAN => true,
            BIG_ENDIAN => false,
            _ => return None,
        };
        let mut reader = Reader {
            bytes: &blob[..blob.len() - 1],
            pos: 2,
            little,
        };
        let srid = reader.i32()?;
        let mbr = [reader.f64()?, reader.f64()?, reader.f64()?, reader.f64()?];
        reader.pos += 1;
        let class = reader.i32()?;
        let shape = reader.shape(class, true)?;
        if reader.pos != reader.bytes.len() {
            return None;
        }
        Some(Self { srid, mbr, shape })
    }

    /// Uncompressed little-endian encoding.
    pub fn to_blob(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(64);
        out.push(BLOB_START);
        out.push(LITTLE_ENDIAN);
        out.extend_from_slice(&self.srid.to_le_bytes());
        for bound in self.mbr {
            out.extend_from_slice(&bound.to_le_bytes());
        }
        out.push(MBR_END);
        let dims = if self.shape.coords().any(|coord| coord.z.is_some()) {
            Dims::Xyz
        } else {
            Dims::Xy
        };
        write_shape(&mut out, &self.shape, dims);
        out.push(BLOB_END);
        out
    }
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
    little: bool,
}

impl Reader<'_> {
    fn take<const N: usize>(&mut self) -> Option<[u8; N]> {
        let end = self.pos.checked_add(N)?;
        let chunk = self.bytes.get(self.pos..end)?;
        self.pos = end;
        chunk.try_into().ok()
    }

    fn u8(&mut self) -> Option<u8> {
        self.take::<1>().map(|[byte]| byte)
    }

    fn i32(&mut self) -> Option<i32> {
        let raw = self.take::<4>()?;
        Some(if self.little {
            i32::from_le_bytes(raw)
        } else {
            i32::from_be_bytes(raw)
        })
    }

    fn count(&mut self) -> Option<usize> {
        usize::try_from(self.i32()?).ok()
    }

    fn f64(&mut self) -> Option<f64> {
        let raw = self.take::<8>()?;
        Some(if self.little {
            f64::from_le_bytes(raw)
        } else {
            f64::from_be_bytes(raw)
        })
    }

    fn f32(&mut self) -> Option<f64> {
        let raw = self.take::<4>()?;
        Some(f64::from(if self.little {
            f32::from_le_bytes(raw)
        } else {
            f32::from_be_bytes(raw)
        }))
    }

    fn shape(&mut self, class: i32, top_level: bool) -> Option<Shape> {
        let compressed = class >= COMPRESSED;
        let rest = class % COMPRESSED;
        let dims = Dims::from_code(rest / 1000)?;
        let base = rest % 1000;
        match (base, compressed) {
            (POINT, false) => self.coord(dims).map(Shape::Point),
            (LINESTRING, false) => self.points(dims).map(Shape::LineString),
            (LINESTRING, true) => self.compressed_points(dims).map(Shape::LineString),
            (POLYGON, compressed) => {
                let rings = self.count()?;
                let mut out = Vec::with_capacity(rings.min(1024));
                for _ in 0..rings {
                    out.push(if compressed {
                        self.compressed_points(dims)?
                    } else {
                        self.points(dims)?
                    });
                }
                Some(Shape::Polygon(out))
            }
            (MULTIPOINT..=COLLECTION, false) if top_level => {
                let members = self.count()?;
                let mut shapes = Vec::with_capacity(members.min(1024));
                for _ in 0..members {
                    if self.u8()? != ENTITY {
                        return None;
                    }
                    let member = self.i32()?;
                    shapes.push(self.shape(member, false)?);
                }
                collect_members(base, shapes)
            }
            _ => None,
        }
    }

    fn coord(&mut self, dims: Dims) -> Option<Coord> {
        let x = self.f64()?;
        let y = self.f64()?;
        let z = if dims.has_z() { Some(self.f64()?) } else { None };
        if dims.has_m() {
            self.f64()?;
        }
        Some(Coord { x, y, z })
    }

    fn points(&mut self, dims: Dims) -> Option<Vec<Coord>> {
        let count = self.count()?;
        let mut points = Vec::with_capacity(count.min(4096));
        for _ in 0..count {
            points.push(self.coord(dims)?);
        }
        Some(points)
    }

    /// First and last vertices are full doubles; the rest are float deltas
    /// from the previous vertex (M stays a full double).
    fn compressed_points(&mut self, dims: Dims) -> Option<Vec<Coord>> {
        let count = self.count()?;
        let mut points: Vec<Coord> = Vec::with_capacity(count.min(4096));
        for index in 0..count {
            if index == 0 || index == count - 1 {
                points.push(self.coord(dims)?);
                continue;
            }
            let prev = points[index - 1];
            let x = prev.x + self.f32()?;
            let y = prev.y + self.f32()?;
            let z = if dims.has_z() {
                Some(prev.z.unwrap_or(0.0) + self.f32()?)
            } else {
                None
            };
            if dims.has_m() {
                self.f64()?;
            }
            points.push(Coord { x, y, z });
        }
        Some(points)
    }
}

fn collect_members(base: i32, shapes: Vec<Shape>) -> Option<Shape> {
    match base {
        MULTIPOINT => shapes
            .into_iter()
            .map(|shape| match shape {
                Shape::Point(point) => Some(point),
                _ => None,
            })
            .collect::<Option<Vec<_>>>()
            .map(Shape::MultiPoint),
        MULTILINESTRING => shapes
            .into_iter()
            .map(|shape| match shape {
                Shape::LineString(points) => Some(points),
                _ => None,
            })
            .collect::<Option<Vec<_>>>()
            .map(Shape::MultiLineString),
        MULTIPOLYGON => shapes
            .into_iter()
            .map(|shape| match shape {
                Shape::Polygon(rings) => Some(rings),
                _ => None,
            })
            .collect::<Option<Vec<_>>>()
            .map(Shape::MultiPolygon),
        _ => Some(Shape::GeometryCollection(shapes)),
    }
}

fn write_shape(out: &mut Vec<u8>, shape: &Shape, dims: Dims) {
    let class = shape.class() + if dims.has_z() { 1000 } else { 0 };
    out.extend_from_slice(&class.to_le_bytes());
    match shape {
        Shape::Point(point) => write_coord(out, point, dims),
        Shape::LineString(points) => write_points(out, points, dims),
        Shape::Polygon(rings) => {
            write_count(out, rings.len());
            for ring in rings {
                write_points(out, ring, dims);
            }
        }
        Shape::MultiPoint(points) => {
            write_members(out, points.iter().map(|point| Shape::Point(*point)), dims)
        }
        Shape::MultiLineString(lines) => write_members(
            out,
            lines.iter().map(|line| Shape::LineString(line.clone())),
            dims,
        ),
        Shape::MultiPolygon(polygons) => write_members(
            out,
            polygons.iter().map(|rings| Shape::Polygon(rings.clone())),
            dims,
        ),
        Shape::GeometryCollection(members) => write_members(out, members.iter().cloned(), dims),
    }
}

fn write_members(out: &mut Vec<u8>, members: impl ExactSizeIterator<Item = Shape>, dims: Dims) {
    write_count(out, members.len());
    for member in members {
        out.push(ENTITY);
        write_shape(out, &member, dims);
    }
}

fn write_count(out: &mut Vec<u8>, count: usize) {
    out.extend_from_slice(&(count as i32).to_le_bytes());
}

fn write_points(out: &mut Vec<u8>, points: &[Coord], dims: Dims) {
    write_count(out, points.len());
    for point in points {
        write_coord(out, point, dims);
    }
}

fn write_coord(out: &mut Vec<u8>, coord: &Coord, dims: Dims) {
    out.extend_from_slice(&coord.x.to_le_bytes());
    out.extend_from_slice(&coord.y.to_le_bytes());
    if dims.has_z() {
        out.extend_from_slice(&coord.z.unwrap_or(0.0).to_le_bytes());
    }
}

/// Reusable GeoJSON output buffer owned by one engine connection.
#[derive(Debug, Default)]
pub struct GeoJsonBuffer {
    out: String,
}

impl GeoJsonBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Renders `geometry` into the buffer and returns the text.
    pub fn render(&mut self, geometry: &Geometry, options: GeoJsonOptions) -> &str {
        self.out.clear();
        let precision = usize::from(options.precision);
        self.out.push_str("{\"type\":\"");
        self.out.push_str(geometry.shape.type_name());
        self.out.push('"');
        if geometry.srid > 0 && (options.short_crs() || options.long_crs()) {
            let name = if options.long_crs() {
                format!("urn:ogc:def:crs:EPSG::{}", geometry.srid)
            } else {
                format!("EPSG:{}", geometry.srid)
            };
            let _ = write!(
                self.out,
                ",\"crs\":{{\"type\":\"name\",\"properties\":{{\"name\":\"{name}\"}}}}"
            );
        }
        if options.with_bbox() {
            self.out.push_str(",\"bbox\":[");
            for (index, bound) in geometry.mbr.iter().enumerate() {
                if index > 0 {
                    self.out.push(',');
                }
                push_number(&mut self.out, *bound, precision);
            }
            self.out.push(']');
        }
        push_body(&mut self.out, &geometry.shape, precision);
        self.out.push('}');
        &self.out
    }

    /// Renders and parses in one step; the buffer is reset afterwards.
    pub fn to_value(&mut self, geometry: &Geometry, options: GeoJsonOptions) -> Result<Value> {
        let parsed = serde_json::from_str(self.render(geometry, options))
            .map_err(|err| Error::Marshal(format!("GeoJSON output: {err}")));
        self.reset();
        parsed
    }

    pub fn reset(&mut self) {
        self.out.clear();
    }

    pub fn release(&mut self) {
        self.out = String::new();
    }
}

fn push_body(out: &mut String, shape: &Shape, precision: usize) {
    if let Shape::GeometryCollection(members) = shape {
        out.push_str(",\"geometries\":[");
        for (index, member) in members.iter().enumerate() {
            if index > 0 {
                out.push(',');
            }
            out.push_str("{\"type\":\"");
            out.push_str(member.type_name());
            out.push('"');
            push_body(out, member, precision);
            out.push('}');
        }
        out.push(']');
        return;
    }
    out.push_str(",\"coordinates\":");
    match shape {
        Shape::Point(point) => push_coord(out, point, precision),
        Shape::LineString(points) | Shape::MultiPoint(points) => {
            push_points(out, points, precision)
        }
        Shape::Polygon(rings) | Shape::MultiLineString(rings) => {
            push_list(out, rings, |out, ring| push_points(out, ring, precision))
        }
        Shape::MultiPolygon(polygons) => push_list(out, polygons, |out, rings| {
            push_list(out, rings, |out, ring| push_points(out, ring, precision))
        }),
        Shape::GeometryCollection(_) => {}
    }
}

fn push_list<T>(out: &mut String, items: &[T], mut each: impl FnMut(&mut String, &T)) {
    out.push('[');
    for (index, item) in items.iter().enumerate() {
        if index > 0 {
            out.push(',');
        }
        each(out, item);
    }
    out.push(']');
}

fn push_points(out: &mut String, points: &[Coord], precision: usize) {
    push_list(out, points, |out, point| push_coord(out, point, precision));
}

fn push_coord(out: &mut String, coord: &Coord, precision: usize) {
    out.push('[');
    push_number(out, coord.x, precision);
    out.push(',');
    push_number(out, coord.y, precision);
    if let Some(z) = coord.z {
        out.push(',');
        push_number(out, z, precision);
    }
    out.push(']');
}

/// Fixed precision with trailing zeros trimmed; `-0` prints as `0`.
fn push_number(out: &mut String, number: f64, precision: usize) {
    if !number.is_finite() {
        out.push_str("null");
        return;
    }
    let mut text = format!("{number:.precision$}");
    if text.contains('.') {
        let trimmed = text.trim_end_matches('0').trim_end_matches('.').len();
        text.truncate(trimmed);
    }
    if text == "-0" {
        text = "0".to_string();
    }
    out.push_str(&text);
}
