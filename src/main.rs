use anyhow::{bail, Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use clap::Parser;
use crossterm::{
    cursor,
    event::{self, DisableMouseCapture, EnableMouseCapture, Event, KeyCode, KeyEventKind, KeyModifiers},
    execute, queue,
    style::{Color, Print, ResetColor, SetBackgroundColor, SetForegroundColor},
    terminal::{
        self, BeginSynchronizedUpdate, ClearType, DisableLineWrap, EnableLineWrap, EndSynchronizedUpdate,
        EnterAlternateScreen, LeaveAlternateScreen,
    },
};
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::Deserialize;
use std::{
    f32::consts::{PI, TAU},
    fs::{File, OpenOptions},
    io::{self, Stdout, Write},
    path::{Path, PathBuf},
    sync::mpsc::{channel, Receiver},
    time::{Duration, Instant},
};

const ASPECT_Y: f32 = 0.55;
const MIN_COLS: u16 = 80;
const MIN_ROWS: u16 = 24;
const FOLLOW_LERP: f32 = 0.05;
const FOLLOW_OFFSET: Vec3 = Vec3 { x: 0.0, y: 2.5, z: 0.0 };
const RING_DRIFT_DAMPING: f32 = 0.12;
const SHIP_LOOK_AHEAD: f32 = 0.05;
const SHIP_BANK_GAIN: f32 = 0.6;
const TRAIL_LEN: usize = 140;
const DAYS_PER_TICK: f64 = 0.25;

// -------------------- CLI --------------------
#[derive(Parser, Debug)]
#[command(name = "solarium", about = "a small solar system for the terminal")]
struct Args {
    /// frame cap
    #[arg(long, default_value_t = 30)]
    fps: u64,

    /// initial time warp (ticks are scaled by this; must be >= 0)
    #[arg(long, default_value_t = 1.0)]
    warp: f32,

    /// backdrop star count (0 = pick from terminal size)
    #[arg(long, default_value_t = 0)]
    stars: usize,

    /// RNG seed for phases/backdrop/ring particles
    #[arg(long, default_value_t = 0x50_1A_21_04)]
    seed: u64,

    /// directory with palette/backdrop files
    #[arg(long, default_value = "assets")]
    assets: PathBuf,

    /// append session notes (asset results, lifecycle) to this file
    #[arg(long)]
    log: Option<PathBuf>,
}

// -------------------- Shared math --------------------
#[derive(Clone, Copy, Debug, Default, PartialEq)]
struct Vec3 {
    x: f32,
    y: f32,
    z: f32,
}
impl Vec3 {
    const ZERO: Vec3 = Vec3 { x: 0.0, y: 0.0, z: 0.0 };

    fn new(x: f32, y: f32, z: f32) -> Vec3 {
        Vec3 { x, y, z }
    }
    fn add(self, o: Vec3) -> Vec3 {
        Vec3::new(self.x + o.x, self.y + o.y, self.z + o.z)
    }
    fn sub(self, o: Vec3) -> Vec3 {
        Vec3::new(self.x - o.x, self.y - o.y, self.z - o.z)
    }
    fn mul(self, k: f32) -> Vec3 {
        Vec3::new(self.x * k, self.y * k, self.z * k)
    }
    fn len(self) -> f32 {
        (self.x * self.x + self.y * self.y + self.z * self.z).sqrt()
    }
}

fn clamp01(x: f32) -> f32 {
    x.max(0.0).min(1.0)
}
fn clamp(x: f32, a: f32, b: f32) -> f32 {
    x.max(a).min(b)
}
fn lerp(a: f32, b: f32, t: f32) -> f32 {
    a + (b - a) * t
}
fn lerp_u8(a: u8, b: u8, t: f32) -> u8 {
    let aa = a as f32;
    let bb = b as f32;
    clamp(aa + (bb - aa) * t, 0.0, 255.0).round() as u8
}
fn lerp_v3(a: Vec3, b: Vec3, t: f32) -> Vec3 {
    Vec3::new(lerp(a.x, b.x, t), lerp(a.y, b.y, t), lerp(a.z, b.z, t))
}

fn v3_rot_y(x: f32, y: f32, z: f32, ang: f32) -> (f32, f32, f32) {
    let (s, c) = ang.sin_cos();
    (c * x + s * z, y, -s * x + c * z)
}

// keep phases in [0, 2pi); a % tau is exact for |a| < tau, so a tick with a
// zero increment leaves the bits untouched
fn wrap_phase(a: f32) -> f32 {
    a.rem_euclid(TAU)
}

// -------------------- UI Cell buffer + diff render --------------------
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Cell {
    ch: char,
    fg: Color,
    bg: Color,
}
impl Cell {
    fn blank(bg: Color) -> Self {
        Self { ch: ' ', fg: Color::Reset, bg }
    }
}

fn put_cell(buf: &mut [Cell], w: u16, h: u16, x: u16, y: u16, c: Cell) {
    let ww = w as usize;
    let hh = h as usize;
    let xi = x as usize;
    let yi = y as usize;
    if xi >= ww || yi >= hh {
        return;
    }
    buf[yi * ww + xi] = c;
}

fn box_draw(buf: &mut [Cell], w: u16, h: u16, x0: u16, y0: u16, bw: u16, bh: u16, fg: Color, bg: Color) {
    if bw < 2 || bh < 2 {
        return;
    }
    let x1 = x0.saturating_add(bw - 1);
    let y1 = y0.saturating_add(bh - 1);

    for x in x0 + 1..x1 {
        put_cell(buf, w, h, x, y0, Cell { ch: '─', fg, bg });
        put_cell(buf, w, h, x, y1, Cell { ch: '─', fg, bg });
    }
    for y in y0 + 1..y1 {
        put_cell(buf, w, h, x0, y, Cell { ch: '│', fg, bg });
        put_cell(buf, w, h, x1, y, Cell { ch: '│', fg, bg });
    }
    put_cell(buf, w, h, x0, y0, Cell { ch: '┌', fg, bg });
    put_cell(buf, w, h, x1, y0, Cell { ch: '┐', fg, bg });
    put_cell(buf, w, h, x0, y1, Cell { ch: '└', fg, bg });
    put_cell(buf, w, h, x1, y1, Cell { ch: '┘', fg, bg });
}

fn write_str(buf: &mut [Cell], w: u16, h: u16, x: u16, y: u16, s: &str, fg: Color, bg: Color) {
    let ww = w as usize;
    let hh = h as usize;
    let yi = y as usize;
    if yi >= hh {
        return;
    }
    let mut xi = x as usize;
    for ch in s.chars() {
        if xi >= ww {
            break;
        }
        buf[yi * ww + xi] = Cell { ch, fg, bg };
        xi += 1;
    }
}

fn write_wrapped(
    buf: &mut [Cell],
    w: u16,
    h: u16,
    x: u16,
    y: u16,
    max_w: u16,
    s: &str,
    fg: Color,
    bg: Color,
) -> u16 {
    if max_w == 0 {
        return 0;
    }
    let mut line = String::new();
    let mut row = y;
    for word in s.split_whitespace() {
        if word.len() > max_w as usize {
            if !line.is_empty() {
                write_str(buf, w, h, x, row, &line, fg, bg);
                row = row.saturating_add(1);
                line.clear();
            }
            let mut start = 0;
            let bytes = word.as_bytes();
            while start < bytes.len() {
                let end = (start + max_w as usize).min(bytes.len());
                let chunk = std::str::from_utf8(&bytes[start..end]).unwrap_or("");
                write_str(buf, w, h, x, row, chunk, fg, bg);
                row = row.saturating_add(1);
                start = end;
            }
            continue;
        }
        let need = if line.is_empty() { word.len() } else { line.len() + 1 + word.len() };
        if need > max_w as usize {
            if !line.is_empty() {
                write_str(buf, w, h, x, row, &line, fg, bg);
                row = row.saturating_add(1);
                line.clear();
            }
        }
        if !line.is_empty() {
            line.push(' ');
        }
        line.push_str(word);
    }
    if !line.is_empty() {
        write_str(buf, w, h, x, row, &line, fg, bg);
    }
    row.saturating_sub(y).saturating_add(1)
}

fn render_diff(out: &mut Stdout, w: u16, h: u16, prev: &mut [Cell], cur: &[Cell]) -> io::Result<()> {
    let mut cur_fg = Color::Reset;
    let mut cur_bg = Color::Reset;

    for y in 0..h as usize {
        for x in 0..w as usize {
            let i = y * (w as usize) + x;
            if prev[i] == cur[i] {
                continue;
            }
            prev[i] = cur[i];

            let c = cur[i];
            queue!(out, cursor::MoveTo(x as u16, y as u16))?;

            if c.bg != cur_bg {
                cur_bg = c.bg;
                queue!(out, SetBackgroundColor(cur_bg))?;
            }
            if c.fg != cur_fg {
                cur_fg = c.fg;
                queue!(out, SetForegroundColor(cur_fg))?;
            }
            queue!(out, Print(c.ch))?;
        }
    }
    Ok(())
}

// -------------------- Colors + palettes --------------------
#[derive(Clone, Copy, Debug, PartialEq, Deserialize)]
struct Rgb {
    r: u8,
    g: u8,
    b: u8,
}
impl Rgb {
    fn to_color(self) -> Color {
        Color::Rgb { r: self.r, g: self.g, b: self.b }
    }
}

fn mix_rgb(a: Rgb, b: Rgb, t: f32) -> Rgb {
    let t = clamp01(t);
    Rgb {
        r: lerp_u8(a.r, b.r, t),
        g: lerp_u8(a.g, b.g, t),
        b: lerp_u8(a.b, b.b, t),
    }
}
fn scale_rgb(a: Rgb, t: f32) -> Rgb {
    let t = clamp01(t);
    Rgb {
        r: clamp((a.r as f32) * t, 0.0, 255.0) as u8,
        g: clamp((a.g as f32) * t, 0.0, 255.0) as u8,
        b: clamp((a.b as f32) * t, 0.0, 255.0) as u8,
    }
}

/// Surface colors for one body. Normally read from `assets/<name>.json`;
/// every body also has a built-in fallback so a missing or broken file
/// only ever costs us the fancier tint.
#[derive(Clone, Copy, Debug, PartialEq, Deserialize)]
struct Palette {
    base: Rgb,
    accent: Rgb,
    glow: Rgb,
}

fn fallback_palette(name: &str) -> Palette {
    let (base, accent, glow) = match name {
        "Sun" => ((255, 200, 110), (255, 240, 170), (255, 180, 90)),
        "Mercury" => ((140, 140, 150), (210, 210, 225), (120, 120, 140)),
        "Venus" => ((230, 180, 95), (255, 230, 165), (255, 200, 110)),
        "Earth" => ((70, 160, 200), (170, 220, 255), (120, 200, 255)),
        "Luna" => ((175, 175, 180), (225, 225, 230), (140, 140, 150)),
        "Mars" => ((205, 80, 40), (255, 160, 95), (255, 120, 70)),
        "Jupiter" => ((195, 145, 100), (255, 220, 180), (255, 205, 160)),
        "Saturn" => ((205, 175, 125), (255, 230, 180), (255, 220, 170)),
        "Uranus" => ((130, 205, 210), (205, 250, 245), (170, 230, 230)),
        "Neptune" => ((75, 125, 205), (160, 200, 255), (130, 170, 255)),
        _ => ((170, 170, 175), (220, 220, 225), (150, 150, 160)),
    };
    Palette {
        base: Rgb { r: base.0, g: base.1, b: base.2 },
        accent: Rgb { r: accent.0, g: accent.1, b: accent.2 },
        glow: Rgb { r: glow.0, g: glow.1, b: glow.2 },
    }
}

// -------------------- Session log --------------------
struct SessionLog {
    file: Option<File>,
}

impl SessionLog {
    fn open(path: Option<&Path>) -> SessionLog {
        let file = path.and_then(|p| OpenOptions::new().create(true).append(true).open(p).ok());
        SessionLog { file }
    }

    fn note(&mut self, msg: &str) {
        if let Some(f) = self.file.as_mut() {
            let stamp = Utc::now().format("%H:%M:%S");
            let _ = writeln!(f, "[{}] {}", stamp, msg);
        }
    }
}

// -------------------- Asset loading --------------------
// Palettes and the backdrop catalog load on one background thread; the
// frame loop drains the channel between ticks and applies whatever has
// resolved. A failed load is an event like any other: the body keeps
// its fallback palette and the session moves on.
#[derive(Debug, Deserialize)]
struct BackdropCatalog {
    stars: Vec<CatalogStar>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
struct CatalogStar {
    x: f32, // 0..1 across the scene area
    y: f32, // 0..1 down the scene area
    depth: f32,
}

enum AssetEvent {
    Palette { body: String, result: std::result::Result<Palette, String> },
    Backdrop { result: std::result::Result<BackdropCatalog, String> },
}

fn load_palette(path: &Path) -> std::result::Result<Palette, String> {
    let text = std::fs::read_to_string(path).map_err(|e| e.to_string())?;
    serde_json::from_str(&text).map_err(|e| e.to_string())
}

fn load_backdrop(dir: &Path) -> std::result::Result<BackdropCatalog, String> {
    // dense catalog first, sparse second; the caller already has the
    // procedural field on screen, so both failing costs nothing visible
    let mut last_err = String::from("no catalog file");
    for name in ["backdrop_dense.json", "backdrop.json"] {
        match std::fs::read_to_string(dir.join(name)) {
            Ok(text) => match serde_json::from_str(&text) {
                Ok(cat) => return Ok(cat),
                Err(e) => last_err = format!("{}: {}", name, e),
            },
            Err(e) => last_err = format!("{}: {}", name, e),
        }
    }
    Err(last_err)
}

fn spawn_asset_loads(dir: PathBuf, bodies: Vec<String>) -> Receiver<AssetEvent> {
    let (tx, rx) = channel();
    std::thread::spawn(move || {
        for body in bodies {
            let path = dir.join(format!("{}.json", body.to_lowercase()));
            let result = load_palette(&path);
            if tx.send(AssetEvent::Palette { body, result }).is_err() {
                return;
            }
        }
        let _ = tx.send(AssetEvent::Backdrop { result: load_backdrop(&dir) });
    });
    rx
}

// -------------------- Orbit kinematics --------------------
// Orbits are kinematic circles: a phase angle advanced by a fixed
// per-tick increment, scaled by the global warp. No forces anywhere.

fn advance_phase(phase: f32, speed: f32, warp: f32) -> f32 {
    wrap_phase(phase + speed * warp)
}

fn advance_spin(spin: f32, speed: f32, warp: f32) -> f32 {
    spin + speed * warp
}

fn orbit_offset(phase: f32, radius: f32) -> Vec3 {
    Vec3::new(phase.cos() * radius, 0.0, phase.sin() * radius)
}

// ships weave above and below the orbital plane
fn ship_lift(phase: f32, amp_a: f32, amp_b: f32) -> f32 {
    (phase * 3.0).sin() * amp_a + (phase * 1.5).cos() * amp_b
}

/// Heading and roll for a ship at `phase`: look a small step ahead along
/// the same track (no stored velocity), bank with a sin(2*phase) roll.
fn ship_attitude(phase: f32, radius: f32, amp_a: f32, amp_b: f32) -> (Vec3, f32) {
    let here = orbit_offset(phase, radius).add(Vec3::new(0.0, ship_lift(phase, amp_a, amp_b), 0.0));
    let ahead_phase = phase + SHIP_LOOK_AHEAD;
    let ahead = orbit_offset(ahead_phase, radius)
        .add(Vec3::new(0.0, ship_lift(ahead_phase, amp_a, amp_b), 0.0));
    let heading = ahead.sub(here);
    let roll = (phase * 2.0).sin() * SHIP_BANK_GAIN;
    (heading, roll)
}

// -------------------- Bodies + registry --------------------
type BodyId = usize;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum BodyKind {
    Star,
    Planet,
    Moon,
    Ship,
}

#[derive(Clone, Copy, Debug)]
struct BodyFacts {
    label: &'static str,
    first_observed: &'static str,
    atmosphere: &'static str,
    trivia: &'static str,
}

/// Registration-time description of a body. `phase: None` means "give me
/// a random start angle"; `parent` names another already-registered body
/// whose position this one orbits around.
struct BodyDesc {
    name: &'static str,
    kind: BodyKind,
    orbit_radius: f32,
    orbit_speed: f32, // rad/tick, negative = retrograde
    spin_speed: f32,  // rad/tick, negative = retrograde
    scale: f32,
    phase: Option<f32>,
    parent: Option<&'static str>,
    lift: (f32, f32), // ship weave amplitudes, (0,0) for everything else
    facts: BodyFacts,
}

struct Body {
    name: &'static str,
    kind: BodyKind,
    orbit_radius: f32,
    orbit_speed: f32,
    spin_speed: f32,
    scale: f32,
    phase: f32,
    spin: f32,
    parent: Option<BodyId>,
    lift: (f32, f32),
    facts: BodyFacts,
    palette: Palette,
    palette_loaded: bool,
    position: Vec3,
}

struct Registry {
    bodies: Vec<Body>,
}

impl Registry {
    fn new() -> Registry {
        Registry { bodies: Vec::new() }
    }

    /// Append a body. Duplicate names and dangling parents are caller
    /// errors; nothing is overwritten.
    fn register(&mut self, desc: BodyDesc, rng: &mut StdRng) -> Result<BodyId> {
        if self.find(desc.name).is_some() {
            bail!("body '{}' is already registered", desc.name);
        }
        let parent = match desc.parent {
            None => None,
            Some(pname) => match self.find(pname) {
                Some(id) => Some(id),
                None => bail!("parent '{}' of '{}' is not registered", pname, desc.name),
            },
        };
        let phase = desc.phase.unwrap_or_else(|| rng.gen_range(0.0..TAU));
        let parent_pos = parent.map(|id| self.bodies[id].position).unwrap_or(Vec3::ZERO);
        let mut body = Body {
            name: desc.name,
            kind: desc.kind,
            orbit_radius: desc.orbit_radius,
            orbit_speed: desc.orbit_speed,
            spin_speed: desc.spin_speed,
            scale: desc.scale,
            phase,
            spin: 0.0,
            parent,
            lift: desc.lift,
            facts: desc.facts,
            palette: fallback_palette(desc.name),
            palette_loaded: false,
            position: Vec3::ZERO,
        };
        body.position = parent_pos.add(orbit_offset(phase, desc.orbit_radius));
        if body.kind == BodyKind::Ship {
            body.position.y = ship_lift(phase, desc.lift.0, desc.lift.1);
        }
        self.bodies.push(body);
        Ok(self.bodies.len() - 1)
    }

    fn find(&self, name: &str) -> Option<BodyId> {
        self.bodies.iter().position(|b| b.name == name)
    }

    fn iter(&self) -> impl Iterator<Item = &Body> {
        self.bodies.iter()
    }

    fn len(&self) -> usize {
        self.bodies.len()
    }
}

// -------------------- Ring assembly --------------------
// Saturn's rings: a fixed table of annular bands (bright bands and the
// dark division gaps between them), a loose particle swarm for grain,
// and a couple of pulsing glow layers. Everything here is positioned
// relative to the planet and follows it for free.

struct RingSegmentDesc {
    inner: f32, // world units from the planet center
    outer: f32,
    thickness: f32,
    speed: f32, // rad/tick, own rotation, independent of planet spin
    opacity: f32,
    gap: bool,
    tint: f32, // toward palette accent
}

const RING_TABLE: [RingSegmentDesc; 6] = [
    RingSegmentDesc { inner: 2.3, outer: 2.7, thickness: 0.08, speed: 0.012, opacity: 0.85, gap: false, tint: 0.25 },
    RingSegmentDesc { inner: 2.7, outer: 2.8, thickness: 0.05, speed: 0.010, opacity: 0.18, gap: true, tint: 0.0 },
    RingSegmentDesc { inner: 2.8, outer: 3.3, thickness: 0.10, speed: 0.009, opacity: 0.92, gap: false, tint: 0.45 },
    RingSegmentDesc { inner: 3.3, outer: 3.4, thickness: 0.04, speed: 0.008, opacity: 0.15, gap: true, tint: 0.0 },
    RingSegmentDesc { inner: 3.4, outer: 3.75, thickness: 0.06, speed: 0.007, opacity: 0.6, gap: false, tint: 0.6 },
    RingSegmentDesc { inner: 3.95, outer: 4.05, thickness: 0.03, speed: 0.005, opacity: 0.35, gap: false, tint: 0.8 },
];

const RING_PARTICLES: usize = 220;
const RING_PARTICLE_SPEED: f32 = 0.010;

struct RingSegment {
    inner: f32,
    outer: f32,
    thickness: f32,
    speed: f32,
    opacity: f32,
    gap: bool,
    color: Rgb,
    rotation: f32,
}

struct RingParticle {
    pos: Vec3, // relative to the planet center
    vel: Vec3,
    color: Rgb,
    size: f32,
}

struct GlowLayer {
    radius: f32,
    base_opacity: f32,
    freq: f32,
    phase: f32,
    opacity: f32,
}

impl GlowLayer {
    fn pulse(&mut self, t_wall: f32) {
        self.opacity = self.base_opacity * (0.9 + 0.1 * (t_wall * self.freq + self.phase).sin());
    }
}

struct RingAssembly {
    planet: BodyId,
    segments: Vec<RingSegment>,
    particles: Vec<RingParticle>,
    glow: Vec<GlowLayer>,
}

impl RingAssembly {
    fn build(planet: BodyId, palette: &Palette, rng: &mut StdRng) -> RingAssembly {
        let dark = Rgb { r: 26, g: 22, b: 18 };
        let segments = RING_TABLE
            .iter()
            .map(|d| RingSegment {
                inner: d.inner,
                outer: d.outer,
                thickness: d.thickness,
                speed: d.speed,
                opacity: d.opacity,
                gap: d.gap,
                color: if d.gap { dark } else { mix_rgb(palette.base, palette.accent, d.tint) },
                rotation: 0.0,
            })
            .collect();

        let r_lo = RING_TABLE[0].inner;
        let r_hi = RING_TABLE[RING_TABLE.len() - 1].outer;
        let mut particles = Vec::with_capacity(RING_PARTICLES);
        for _ in 0..RING_PARTICLES {
            let ang = rng.gen_range(0.0..TAU);
            let r = rng.gen_range(r_lo..r_hi);
            // slower out wide, like the bands
            let s = RING_PARTICLE_SPEED * (r_lo / r).sqrt();
            particles.push(RingParticle {
                pos: Vec3::new(ang.cos() * r, rng.gen_range(-0.04..0.04), ang.sin() * r),
                vel: Vec3::new(-ang.sin() * s, 0.0, ang.cos() * s),
                color: mix_rgb(palette.base, palette.accent, rng.gen_range(0.1..0.9)),
                size: rng.gen_range(0.4..1.0),
            });
        }

        let glow = vec![
            GlowLayer { radius: 4.3, base_opacity: 0.45, freq: 1.3, phase: 0.0, opacity: 0.45 },
            GlowLayer { radius: 4.7, base_opacity: 0.25, freq: 0.8, phase: 1.9, opacity: 0.25 },
        ];

        RingAssembly { planet, segments, particles, glow }
    }

    /// Warp-scaled updates: band rotation and particle drift. Particles
    /// are never clamped back to their radius; over very long runs they
    /// wander, which reads as ring grain doing ring-grain things.
    fn tick(&mut self, warp: f32) {
        for seg in self.segments.iter_mut() {
            seg.rotation += seg.speed * warp;
        }
        for p in self.particles.iter_mut() {
            p.pos = p.pos.add(p.vel.mul(warp * RING_DRIFT_DAMPING));
        }
    }

    // wall-clock pulse, runs even while paused
    fn pulse(&mut self, t_wall: f32) {
        for g in self.glow.iter_mut() {
            g.pulse(t_wall);
        }
    }

    fn swap_palette(&mut self, palette: &Palette) {
        for (seg, desc) in self.segments.iter_mut().zip(RING_TABLE.iter()) {
            if !seg.gap {
                seg.color = mix_rgb(palette.base, palette.accent, desc.tint);
            }
        }
        for p in self.particles.iter_mut() {
            p.color = mix_rgb(palette.base, palette.accent, 0.5);
        }
    }
}

// -------------------- Camera --------------------
struct Camera {
    focus: Vec3, // the point the view is centered on
    yaw: f32,
    tilt: f32,
    zoom: f32,
    follow: Option<BodyId>,
}

impl Camera {
    fn new() -> Camera {
        Camera { focus: Vec3::ZERO, yaw: 0.0, tilt: 0.5, zoom: 1.0, follow: None }
    }

    /// Ease the focus toward the target. Geometric convergence: a fixed
    /// fraction of the remaining distance per tick, so we trail a moving
    /// body smoothly and never snap.
    fn follow_tick(&mut self, target: Vec3) {
        self.focus = lerp_v3(self.focus, target.add(FOLLOW_OFFSET), FOLLOW_LERP);
    }

    fn reset_view(&mut self) {
        self.yaw = 0.0;
        self.tilt = 0.5;
        self.zoom = 1.0;
    }
}

/// World point -> (column, row, view depth). Orthographic with a yaw
/// turn and a tilt that folds height into the vertical axis; depth is
/// used for paint order only.
fn project(p: Vec3, cam: &Camera, cx: f32, cy: f32, base_scale: f32) -> (f32, f32, f32) {
    let rel = p.sub(cam.focus);
    let (x1, y1, z1) = v3_rot_y(rel.x, rel.y, rel.z, cam.yaw);
    let (ts, tc) = cam.tilt.sin_cos();
    let sy = z1 * ts - y1 * tc;
    let depth = z1 * tc + y1 * ts;
    let s = base_scale * cam.zoom;
    (cx + x1 * s, cy + sy * s * ASPECT_Y, depth)
}

// -------------------- Scheduler --------------------
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum RunState {
    Running,
    Paused,
}

/// The whole simulation context: registry, rings, camera, warp and the
/// tick bookkeeping. One of these is threaded through the frame loop and
/// the tests; there is no global state anywhere.
struct Sim {
    registry: Registry,
    rings: Option<RingAssembly>,
    camera: Camera,
    state: RunState,
    warp: f32,       // global time scale, >= 0
    body_scale: f32, // uniform visual scale on every body
    tick_count: u64,
    clock_days: f64, // mission clock, advances with the warp
}

impl Sim {
    fn new(registry: Registry, rings: Option<RingAssembly>) -> Sim {
        Sim {
            registry,
            rings,
            camera: Camera::new(),
            state: RunState::Running,
            warp: 1.0,
            body_scale: 1.0,
            tick_count: 0,
            clock_days: 0.0,
        }
    }

    /// One frame of simulation. Wall-clock cosmetics (glow pulse) always
    /// run; kinematics, ring motion, the camera and the bookkeeping only
    /// run while RUNNING. A zero warp is different: the full tick runs
    /// and every increment is exactly zero.
    fn tick(&mut self, t_wall: f32) {
        if let Some(rings) = self.rings.as_mut() {
            rings.pulse(t_wall);
        }
        if self.state == RunState::Paused {
            return;
        }

        // pass 1: bodies that orbit the origin
        for body in self.registry.bodies.iter_mut() {
            if body.parent.is_some() {
                continue;
            }
            body.phase = advance_phase(body.phase, body.orbit_speed, self.warp);
            body.spin = advance_spin(body.spin, body.spin_speed, self.warp);
            let mut pos = orbit_offset(body.phase, body.orbit_radius);
            if body.kind == BodyKind::Ship {
                pos.y = ship_lift(body.phase, body.lift.0, body.lift.1);
            }
            body.position = pos;
        }

        // pass 2: bodies that orbit another body, reading the position
        // committed above — registration order can't go stale
        for i in 0..self.registry.bodies.len() {
            let parent = match self.registry.bodies[i].parent {
                Some(p) => p,
                None => continue,
            };
            let parent_pos = self.registry.bodies[parent].position;
            let body = &mut self.registry.bodies[i];
            body.phase = advance_phase(body.phase, body.orbit_speed, self.warp);
            body.spin = advance_spin(body.spin, body.spin_speed, self.warp);
            body.position = parent_pos.add(orbit_offset(body.phase, body.orbit_radius));
        }

        if let Some(rings) = self.rings.as_mut() {
            rings.tick(self.warp);
        }

        if let Some(id) = self.camera.follow {
            if id < self.registry.len() {
                let target = self.registry.bodies[id].position;
                self.camera.follow_tick(target);
            }
        }

        self.tick_count += 1;
        self.clock_days += self.warp as f64 * DAYS_PER_TICK;
    }

    fn pause(&mut self) {
        self.state = RunState::Paused;
    }

    fn resume(&mut self) {
        self.state = RunState::Running;
    }

    /// Reject bad values at the boundary, keep the previous one.
    fn set_warp(&mut self, value: f32) -> bool {
        if !value.is_finite() || value < 0.0 {
            return false;
        }
        self.warp = value;
        true
    }

    fn set_body_scale(&mut self, factor: f32) -> bool {
        if !factor.is_finite() || factor <= 0.0 {
            return false;
        }
        self.body_scale = factor;
        true
    }

    fn set_follow(&mut self, target: Option<BodyId>) {
        self.camera.follow = target.filter(|id| *id < self.registry.len());
    }

    fn apply_asset(&mut self, ev: AssetEvent, log: &mut SessionLog) -> Option<BackdropCatalog> {
        match ev {
            AssetEvent::Palette { body, result } => {
                let id = match self.registry.find(&body) {
                    Some(id) => id,
                    None => return None,
                };
                match result {
                    Ok(p) => {
                        self.registry.bodies[id].palette = p;
                        self.registry.bodies[id].palette_loaded = true;
                        if let Some(rings) = self.rings.as_mut() {
                            if rings.planet == id {
                                rings.swap_palette(&p);
                            }
                        }
                        log.note(&format!("palette loaded for {}", body));
                    }
                    Err(e) => {
                        // fallback colors stay in place; the body is
                        // fully alive either way
                        log.note(&format!("palette for {} unavailable ({}), using fallback", body, e));
                    }
                }
                None
            }
            AssetEvent::Backdrop { result } => match result {
                Ok(cat) => {
                    log.note(&format!("backdrop catalog loaded ({} stars)", cat.stars.len()));
                    Some(cat)
                }
                Err(e) => {
                    log.note(&format!("backdrop catalog unavailable ({}), keeping procedural field", e));
                    None
                }
            },
        }
    }
}

/// Nearest body under a screen cell, or none. Hit radius grows with the
/// body's visual scale so fat planets are easier to click than ships.
fn pick_body(sim: &Sim, cx: f32, cy: f32, base_scale: f32, mx: u16, my: u16) -> Option<BodyId> {
    let mut best: Option<(BodyId, f32)> = None;
    for (id, body) in sim.registry.iter().enumerate() {
        let (sx, sy, _) = project(body.position, &sim.camera, cx, cy, base_scale);
        let dx = sx - mx as f32;
        let dy = (sy - my as f32) / ASPECT_Y; // undo the squash so the hit zone is round
        let d = (dx * dx + dy * dy).sqrt();
        let reach = (1.2 * body.scale * sim.body_scale * sim.camera.zoom).max(2.0);
        if d <= reach {
            match best {
                Some((_, bd)) if bd <= d => {}
                _ => best = Some((id, d)),
            }
        }
    }
    best.map(|(id, _)| id)
}

// -------------------- Scene composition --------------------
#[derive(Clone, Copy)]
struct BackStar {
    x: u16,
    y: u16,
    phase: f32,
    depth: f32,
}

struct Scene {
    stars: Vec<BackStar>,
    catalog: Option<BackdropCatalog>,
    sun_glow: Vec<GlowLayer>,
    show_orbits: bool,
    show_labels: bool,
    show_trails: bool,
    trails: Vec<Vec<Vec3>>,
}

impl Scene {
    fn build(w: u16, h: u16, star_count: usize, seed: u64, catalog: Option<BackdropCatalog>, n_bodies: usize) -> Scene {
        let mut scene = Scene {
            stars: Vec::new(),
            catalog,
            sun_glow: vec![
                GlowLayer { radius: 1.3, base_opacity: 0.8, freq: 1.1, phase: 0.0, opacity: 0.8 },
                GlowLayer { radius: 2.0, base_opacity: 0.45, freq: 0.7, phase: 2.3, opacity: 0.45 },
                GlowLayer { radius: 2.8, base_opacity: 0.22, freq: 0.45, phase: 4.1, opacity: 0.22 },
            ],
            show_orbits: true,
            show_labels: true,
            show_trails: true,
            trails: vec![Vec::new(); n_bodies],
        };
        scene.rebuild_stars(w, h, star_count, seed);
        scene
    }

    /// (Re)build the backdrop for a given scene area. Catalog stars map
    /// into the area; otherwise a seeded procedural field fills in, so
    /// something is on screen from the very first frame.
    fn rebuild_stars(&mut self, w: u16, h: u16, star_count: usize, seed: u64) {
        self.stars.clear();
        if w == 0 || h == 0 {
            return;
        }
        if let Some(cat) = self.catalog.as_ref() {
            for s in cat.stars.iter() {
                let x = (clamp01(s.x) * (w.saturating_sub(1)) as f32) as u16;
                let y = (clamp01(s.y) * (h.saturating_sub(1)) as f32) as u16;
                self.stars.push(BackStar {
                    x,
                    y,
                    phase: (s.x * 37.0 + s.y * 17.0) % TAU,
                    depth: clamp(s.depth, 0.2, 1.0),
                });
            }
            return;
        }
        let count = if star_count > 0 {
            star_count
        } else {
            ((w as usize * h as usize) / 70).clamp(60, 240)
        };
        let mut rng = StdRng::seed_from_u64(seed ^ ((w as u64) << 32) ^ (h as u64));
        for _ in 0..count {
            self.stars.push(BackStar {
                x: rng.gen_range(0..w),
                y: rng.gen_range(0..h),
                phase: rng.gen_range(0.0..TAU),
                depth: rng.gen_range(0.35..1.0),
            });
        }
    }

    fn pulse(&mut self, t_wall: f32) {
        for g in self.sun_glow.iter_mut() {
            g.pulse(t_wall);
        }
    }

    fn push_trails(&mut self, registry: &Registry) {
        if self.trails.len() != registry.len() {
            self.trails = vec![Vec::new(); registry.len()];
        }
        for (i, body) in registry.iter().enumerate() {
            if body.kind == BodyKind::Star {
                continue;
            }
            let trail = &mut self.trails[i];
            trail.push(body.position);
            if trail.len() > TRAIL_LEN {
                let overflow = trail.len() - TRAIL_LEN;
                trail.drain(0..overflow);
            }
        }
    }
}

// -------------------- Renderer --------------------
// Painter-with-depth: the scene area keeps a little depth buffer so
// rings, moons and planets overlap correctly without sorting glyphs.

struct ZBuf {
    depth: Vec<f32>,
    w: usize,
    h: usize,
}

impl ZBuf {
    fn new(w: u16, h: u16) -> ZBuf {
        ZBuf { depth: vec![f32::NEG_INFINITY; w as usize * h as usize], w: w as usize, h: h as usize }
    }

    fn put(&mut self, buf: &mut [Cell], bw: u16, bh: u16, x: f32, y: f32, depth: f32, cell: Cell) {
        if x < 0.0 || y < 0.0 {
            return;
        }
        let xi = x as usize;
        let yi = y as usize;
        if xi >= self.w || yi >= self.h {
            return;
        }
        let i = yi * self.w + xi;
        if depth < self.depth[i] {
            return;
        }
        self.depth[i] = depth;
        put_cell(buf, bw, bh, xi as u16, yi as u16, cell);
    }
}

fn ship_glyph(heading: Vec3, roll: f32, cam: &Camera) -> char {
    // project the heading, add the bank roll, snap to 8 directions
    let (hx, hy, hz) = v3_rot_y(heading.x, heading.y, heading.z, cam.yaw);
    let (ts, tc) = cam.tilt.sin_cos();
    let sy = hz * ts - hy * tc;
    let ang = sy.atan2(hx) + roll;
    const GLYPHS: [char; 8] = ['→', '↘', '↓', '↙', '←', '↖', '↑', '↗'];
    let idx = ((ang / (TAU / 8.0)).round() as i32).rem_euclid(8) as usize;
    GLYPHS[idx]
}

fn render_scene(
    buf: &mut [Cell],
    w: u16,
    h: u16,
    sim: &Sim,
    scene: &Scene,
    selected: BodyId,
    t_wall: f32,
    sim_date: DateTime<Utc>,
) {
    let bg = Color::Black;
    let fg = Color::Rgb { r: 220, g: 220, b: 220 };
    let dim = Color::Rgb { r: 120, g: 120, b: 120 };
    let edge = Color::Rgb { r: 80, g: 95, b: 120 };

    let (main_w, cx, cy, base_scale) = scene_metrics(w, h, &sim.registry);
    let hud_w = w.saturating_sub(main_w);

    for y in 0..h {
        put_cell(buf, w, h, main_w, y, Cell { ch: '│', fg: edge, bg });
    }

    // backdrop
    for s in scene.stars.iter() {
        if s.x >= main_w {
            continue;
        }
        let tw = (t_wall * 0.65 + s.phase).sin() * 0.5 + 0.5;
        let b = lerp(0.2, 1.0, tw * s.depth);
        let c = clamp(40.0 + b * 180.0, 0.0, 255.0) as u8;
        let ch = if b > 0.82 { '✦' } else if b > 0.62 { '•' } else { '·' };
        put_cell(
            buf,
            w,
            h,
            s.x,
            s.y,
            Cell { ch, fg: Color::Rgb { r: c, g: c, b: (c as u16 + 25).min(255) as u8 }, bg },
        );
    }

    let cam = &sim.camera;
    let mut z = ZBuf::new(main_w, h);

    // orbit guides: dotted circles around each body's parent
    if scene.show_orbits {
        for (gi, body) in sim.registry.iter().enumerate() {
            if body.kind == BodyKind::Star || body.orbit_radius <= 0.0 {
                continue;
            }
            let center = body.parent.map(|p| sim.registry.bodies[p].position).unwrap_or(Vec3::ZERO);
            let steps = ((body.orbit_radius * base_scale * cam.zoom) * 6.0).max(30.0) as i32;
            for k in 0..steps {
                if (k + gi as i32) % 3 != 0 {
                    continue;
                }
                let a = TAU * (k as f32 / steps as f32);
                let p = center.add(orbit_offset(a, body.orbit_radius));
                let (sx, sy, depth) = project(p, cam, cx, cy, base_scale);
                if sx >= 1.0 && sy >= 1.0 && sx < (main_w - 1) as f32 && sy < (h - 1) as f32 {
                    z.put(buf, w, h, sx, sy, depth - 50.0, Cell { ch: '·', fg: edge, bg });
                }
            }
        }
    }

    // trails
    if scene.show_trails {
        for (i, trail) in scene.trails.iter().enumerate() {
            if i >= sim.registry.len() {
                break;
            }
            let body = &sim.registry.bodies[i];
            if body.kind == BodyKind::Star {
                continue;
            }
            for (ti, p) in trail.iter().enumerate() {
                let fade = lerp(0.12, 0.8, (ti as f32) / (trail.len().max(1) as f32));
                let col = scale_rgb(body.palette.base, fade);
                let (sx, sy, depth) = project(*p, cam, cx, cy, base_scale);
                if sx >= 1.0 && sy >= 1.0 && sx < (main_w - 1) as f32 && sy < (h - 1) as f32 {
                    z.put(buf, w, h, sx, sy, depth - 40.0, Cell { ch: '·', fg: col.to_color(), bg });
                }
            }
        }
    }

    // sun glow shells, pulsing on the wall clock
    if let Some(sun) = sim.registry.iter().find(|b| b.kind == BodyKind::Star) {
        for g in scene.sun_glow.iter() {
            let rr = g.radius * sun.scale * sim.body_scale;
            let steps = ((rr * base_scale * cam.zoom) * 7.0).max(18.0) as i32;
            for k in 0..steps {
                let a = TAU * (k as f32 / steps as f32);
                let p = sun.position.add(orbit_offset(a, rr));
                let dither = ((k * 7 + 3) % 10) as f32 / 10.0;
                if g.opacity < dither {
                    continue;
                }
                let (sx, sy, depth) = project(p, cam, cx, cy, base_scale);
                if sx >= 1.0 && sy >= 1.0 && sx < (main_w - 1) as f32 && sy < (h - 1) as f32 {
                    let col = scale_rgb(sun.palette.glow, 0.35 + 0.65 * g.opacity);
                    z.put(buf, w, h, sx, sy, depth - 1.0, Cell { ch: '·', fg: col.to_color(), bg });
                }
            }
        }
    }

    // Saturn's rings: bands, division gaps, grain, rim glow
    if let Some(rings) = sim.rings.as_ref() {
        let planet = &sim.registry.bodies[rings.planet];
        let rs = sim.body_scale;
        for seg in rings.segments.iter() {
            for row in [0.3f32, 0.7] {
                let rr = lerp(seg.inner, seg.outer, row) * rs;
                let lift = (row - 0.5) * seg.thickness * rs;
                let steps = ((rr * base_scale * cam.zoom) * 8.0).max(36.0) as i32;
                let spin_shift = (seg.rotation * steps as f32 / TAU) as i32;
                for k in 0..steps {
                    // the dash pattern rides the segment's own rotation
                    let dash = (k + spin_shift).rem_euclid(4);
                    if seg.gap {
                        if dash != 0 {
                            continue;
                        }
                    } else if dash == 3 {
                        continue;
                    }
                    let a = seg.rotation + TAU * (k as f32 / steps as f32);
                    let p = planet.position.add(Vec3::new(a.cos() * rr, lift, a.sin() * rr));
                    let (sx, sy, depth) = project(p, cam, cx, cy, base_scale);
                    if sx >= 1.0 && sy >= 1.0 && sx < (main_w - 1) as f32 && sy < (h - 1) as f32 {
                        let ch = if seg.gap {
                            '·'
                        } else if seg.opacity > 0.7 {
                            '•'
                        } else {
                            '·'
                        };
                        let col = scale_rgb(seg.color, 0.3 + 0.7 * seg.opacity);
                        z.put(buf, w, h, sx, sy, depth, Cell { ch, fg: col.to_color(), bg });
                    }
                }
            }
        }
        for p in rings.particles.iter() {
            let world = planet.position.add(p.pos.mul(rs));
            let (sx, sy, depth) = project(world, cam, cx, cy, base_scale);
            if sx >= 1.0 && sy >= 1.0 && sx < (main_w - 1) as f32 && sy < (h - 1) as f32 {
                let ch = if p.size > 0.75 { '∙' } else { '·' };
                z.put(buf, w, h, sx, sy, depth, Cell { ch, fg: scale_rgb(p.color, 0.8).to_color(), bg });
            }
        }
        for g in rings.glow.iter() {
            let rr = g.radius * rs;
            let steps = ((rr * base_scale * cam.zoom) * 5.0).max(24.0) as i32;
            for k in 0..steps {
                let dither = ((k * 3 + 1) % 8) as f32 / 8.0;
                if g.opacity < dither {
                    continue;
                }
                let a = TAU * (k as f32 / steps as f32);
                let p = planet.position.add(Vec3::new(a.cos() * rr, 0.0, a.sin() * rr));
                let (sx, sy, depth) = project(p, cam, cx, cy, base_scale);
                if sx >= 1.0 && sy >= 1.0 && sx < (main_w - 1) as f32 && sy < (h - 1) as f32 {
                    let col = scale_rgb(planet.palette.glow, 0.25 + 0.5 * g.opacity);
                    z.put(buf, w, h, sx, sy, depth - 0.5, Cell { ch: '∘', fg: col.to_color(), bg });
                }
            }
        }
    }

    // bodies
    for (i, body) in sim.registry.iter().enumerate() {
        let (sx, sy, depth) = project(body.position, cam, cx, cy, base_scale);
        if sx < 1.0 || sy < 1.0 || sx >= (main_w - 1) as f32 || sy >= (h - 1) as f32 {
            continue;
        }
        let ch = match body.kind {
            BodyKind::Star => '◉',
            BodyKind::Ship => {
                let (heading, roll) = ship_attitude(body.phase, body.orbit_radius, body.lift.0, body.lift.1);
                ship_glyph(heading, roll, cam)
            }
            _ if i == selected => '◆',
            _ => '●',
        };
        // spin shows up as a slow shimmer between base and accent
        let shimmer = 0.5 + 0.5 * body.spin.sin();
        let col = mix_rgb(body.palette.base, body.palette.accent, 0.25 + 0.35 * shimmer);
        z.put(buf, w, h, sx, sy, depth + 10.0, Cell { ch, fg: col.to_color(), bg });
        if scene.show_labels && body.kind != BodyKind::Ship {
            let label_fg = if i == selected { col.to_color() } else { dim };
            write_str(buf, w, h, (sx as u16).saturating_add(2).min(main_w.saturating_sub(1)), sy as u16, body.name, label_fg, bg);
        }
    }

    // -------------------- HUD --------------------
    let top_h = 9u16.min(h.saturating_sub(8).max(6));
    let list_h = (sim.registry.len() as u16 + 3).min(h.saturating_sub(top_h + 12));
    let facts_y = top_h + list_h;
    let facts_h = h.saturating_sub(facts_y);
    box_draw(buf, w, h, main_w, 0, hud_w, top_h, edge, bg);
    box_draw(buf, w, h, main_w, top_h, hud_w, list_h, edge, bg);
    box_draw(buf, w, h, main_w, facts_y, hud_w, facts_h, edge, bg);

    let panel_x = main_w + 2;
    let panel_w = hud_w.saturating_sub(4);

    let mut ty = 1u16;
    write_str(buf, w, h, panel_x, ty, "solarium", fg, bg);
    ty += 1;
    write_str(buf, w, h, panel_x, ty, &format!("Clock: {}", sim_date.format("%Y-%m-%d %H:%M")), dim, bg);
    ty += 1;
    write_str(buf, w, h, panel_x, ty, &format!("Warp: {:.2}x", sim.warp), dim, bg);
    ty += 1;
    let state = match sim.state {
        RunState::Running => "running",
        RunState::Paused => "paused",
    };
    write_str(buf, w, h, panel_x, ty, &format!("State: {}", state), dim, bg);
    ty += 1;
    let follow_name = sim
        .camera
        .follow
        .and_then(|id| sim.registry.bodies.get(id))
        .map(|b| b.name)
        .unwrap_or("free");
    write_str(buf, w, h, panel_x, ty, &format!("Follow: {}", follow_name), dim, bg);
    ty += 1;
    write_str(
        buf,
        w,
        h,
        panel_x,
        ty,
        &format!("Zoom {:.2}  Size {:.2}", sim.camera.zoom, sim.body_scale),
        dim,
        bg,
    );

    // selection list, straight out of the registry
    let mut ly = top_h + 1;
    write_str(buf, w, h, panel_x, ly, "Bodies", fg, bg);
    ly += 1;
    for (i, body) in sim.registry.iter().enumerate() {
        if ly >= facts_y.saturating_sub(1) {
            break;
        }
        let marker = if i == selected { '▸' } else { ' ' };
        let dot_col = body.palette.base.to_color();
        put_cell(buf, w, h, panel_x, ly, Cell { ch: marker, fg, bg });
        put_cell(buf, w, h, panel_x + 1, ly, Cell { ch: '●', fg: dot_col, bg });
        let name_fg = if i == selected { fg } else { dim };
        let tag = if i < 10 { format!("{} {}", i, body.name) } else { format!("  {}", body.name) };
        write_str(buf, w, h, panel_x + 3, ly, &tag, name_fg, bg);
        ly += 1;
    }

    // facts for the selection
    if let Some(body) = sim.registry.bodies.get(selected) {
        let mut fy = facts_y + 1;
        write_str(buf, w, h, panel_x, fy, body.facts.label, fg, bg);
        fy += 1;
        let source = if body.palette_loaded { "palette: loaded" } else { "palette: fallback" };
        write_str(buf, w, h, panel_x, fy, source, dim, bg);
        fy += 1;
        for line in [
            format!("Seen: {}", body.facts.first_observed),
            format!("Air: {}", body.facts.atmosphere),
            format!("Note: {}", body.facts.trivia),
            format!("r(orbit): {:.1}  v: {:+.4}", body.orbit_radius, body.orbit_speed),
        ] {
            if fy >= h.saturating_sub(6) {
                break;
            }
            fy += write_wrapped(buf, w, h, panel_x, fy, panel_w, &line, dim, bg);
        }
        let mut ky = h.saturating_sub(5);
        for line in [
            "0-9 pick  ,/. cycle  F follow",
            "click: inspect  O orbits  T trails",
            "A/D yaw  ↑/↓ tilt  W/S zoom",
            "-/+ warp  </> size  P pause  Q quit",
        ] {
            write_str(buf, w, h, panel_x, ky, line, dim, bg);
            ky += 1;
        }
    }
}

/// Scene-area layout shared by the renderer and mouse picking: panel
/// split, projection center and the scale that fits the outermost orbit.
fn scene_metrics(w: u16, h: u16, registry: &Registry) -> (u16, f32, f32, f32) {
    let hud_w = 34u16.min(w / 2);
    let main_w = w.saturating_sub(hud_w);
    let cx = (main_w as f32) * 0.5;
    let cy = (h as f32) * 0.52;
    let outer = registry
        .iter()
        .filter(|b| b.parent.is_none())
        .map(|b| b.orbit_radius)
        .fold(1.0f32, f32::max)
        + 2.0;
    let fit_x = (cx - 2.0) / outer;
    let fit_y = ((h as f32) * 0.5 - 2.0) / (outer * ASPECT_Y);
    (main_w, cx, cy, fit_x.min(fit_y))
}

// -------------------- Main --------------------
fn build_sim(rng: &mut StdRng) -> Result<Sim> {
    let mut registry = Registry::new();
    for desc in default_system() {
        registry.register(desc, rng)?;
    }
    let saturn = registry.find("Saturn").context("system table must include Saturn")?;
    let pal = registry.bodies[saturn].palette;
    let rings = RingAssembly::build(saturn, &pal, rng);
    Ok(Sim::new(registry, Some(rings)))
}

fn main() -> Result<()> {
    let args = Args::parse();
    let mut log = SessionLog::open(args.log.as_deref());

    let (w, h) = terminal::size().context("cannot query the terminal")?;
    if w < MIN_COLS || h < MIN_ROWS {
        bail!(
            "terminal is {}x{}; solarium needs at least {}x{}",
            w,
            h,
            MIN_COLS,
            MIN_ROWS
        );
    }
    terminal::enable_raw_mode().context("raw mode unavailable; run from an interactive terminal")?;

    let mut out = io::stdout();
    execute!(out, EnterAlternateScreen, cursor::Hide, DisableLineWrap, EnableMouseCapture)?;
    let res = run(&mut out, &args, &mut log);
    execute!(
        out,
        EndSynchronizedUpdate,
        ResetColor,
        DisableMouseCapture,
        cursor::Show,
        EnableLineWrap,
        LeaveAlternateScreen
    )?;
    terminal::disable_raw_mode()?;
    log.note("session end");
    res
}

fn run(out: &mut Stdout, args: &Args, log: &mut SessionLog) -> Result<()> {
    let mut rng = StdRng::seed_from_u64(args.seed);
    let mut sim = build_sim(&mut rng)?;
    if !sim.set_warp(args.warp) {
        log.note(&format!("rejected warp {}; keeping {:.2}", args.warp, sim.warp));
    }
    let mut selected: BodyId = sim.registry.find("Earth").unwrap_or(0);
    sim.set_follow(Some(selected));

    let mut assets = spawn_asset_loads(
        args.assets.clone(),
        sim.registry.iter().map(|b| b.name.to_string()).collect(),
    );
    log.note("session start");

    let epoch = Utc.with_ymd_and_hms(2000, 1, 1, 12, 0, 0).unwrap();

    let mut prev_w: u16 = 0;
    let mut prev_h: u16 = 0;
    let mut prev_buf: Vec<Cell> = Vec::new();
    let mut cur_buf: Vec<Cell> = Vec::new();
    let mut scene = Scene::build(0, 0, args.stars, args.seed, None, sim.registry.len());

    let start_time = Instant::now();
    let frame_dt = Duration::from_millis(1000 / args.fps.max(1));

    loop {
        // input
        while event::poll(Duration::from_millis(0))? {
            match event::read()? {
                Event::Key(k) if k.kind == KeyEventKind::Press => {
                    let ctrl = k.modifiers.contains(KeyModifiers::CONTROL);
                    match k.code {
                        KeyCode::Char('q') | KeyCode::Char('Q') | KeyCode::Esc => return Ok(()),

                        KeyCode::Char('p') | KeyCode::Char('P') | KeyCode::Char(' ') => {
                            match sim.state {
                                RunState::Running => sim.pause(),
                                RunState::Paused => sim.resume(),
                            }
                        }

                        KeyCode::Char('r') | KeyCode::Char('R') if ctrl => {
                            // full teardown: fresh registry, fresh scene,
                            // fresh asset loads; configuration survives
                            let warp = sim.warp;
                            let body_scale = sim.body_scale;
                            sim = build_sim(&mut rng)?;
                            sim.set_warp(warp);
                            sim.set_body_scale(body_scale);
                            selected = sim.registry.find("Earth").unwrap_or(0);
                            sim.set_follow(Some(selected));
                            assets = spawn_asset_loads(
                                args.assets.clone(),
                                sim.registry.iter().map(|b| b.name.to_string()).collect(),
                            );
                            scene = Scene::build(0, 0, args.stars, args.seed, None, sim.registry.len());
                            prev_w = 0;
                            prev_h = 0;
                            log.note("scene rebuilt");
                        }
                        KeyCode::Char('r') | KeyCode::Char('R') => sim.camera.reset_view(),

                        KeyCode::Char(c @ '0'..='9') => {
                            let idx = (c as u8 - b'0') as usize;
                            if idx < sim.registry.len() {
                                selected = idx;
                                sim.set_follow(Some(idx));
                            }
                        }
                        KeyCode::Char(',') => {
                            selected = (selected + sim.registry.len() - 1) % sim.registry.len();
                            sim.set_follow(Some(selected));
                        }
                        KeyCode::Char('.') => {
                            selected = (selected + 1) % sim.registry.len();
                            sim.set_follow(Some(selected));
                        }
                        KeyCode::Char('f') | KeyCode::Char('F') => {
                            if sim.camera.follow.is_some() {
                                sim.set_follow(None);
                            } else {
                                sim.set_follow(Some(selected));
                            }
                        }

                        KeyCode::Char('o') | KeyCode::Char('O') => scene.show_orbits = !scene.show_orbits,
                        KeyCode::Char('t') | KeyCode::Char('T') => scene.show_trails = !scene.show_trails,
                        KeyCode::Char('l') | KeyCode::Char('L') => scene.show_labels = !scene.show_labels,

                        KeyCode::Char('=') | KeyCode::Char('+') => {
                            sim.set_warp(sim.warp * 2.0);
                        }
                        KeyCode::Char('-') => {
                            sim.set_warp(sim.warp * 0.5);
                        }
                        KeyCode::Char(']') => {
                            sim.set_warp(sim.warp * 1.25);
                        }
                        KeyCode::Char('[') => {
                            sim.set_warp(sim.warp * 0.8);
                        }
                        KeyCode::Char('>') => {
                            sim.set_body_scale(sim.body_scale * 1.15);
                        }
                        KeyCode::Char('<') => {
                            sim.set_body_scale(sim.body_scale / 1.15);
                        }

                        KeyCode::Char('a') | KeyCode::Char('A') => sim.camera.yaw -= 0.08,
                        KeyCode::Char('d') | KeyCode::Char('D') => sim.camera.yaw += 0.08,
                        KeyCode::Up => sim.camera.tilt = (sim.camera.tilt + 0.06).min(1.45),
                        KeyCode::Down => sim.camera.tilt = (sim.camera.tilt - 0.06).max(0.05),
                        KeyCode::Char('w') | KeyCode::Char('W') => {
                            sim.camera.zoom = (sim.camera.zoom * 1.10).min(6.0);
                        }
                        KeyCode::Char('s') | KeyCode::Char('S') => {
                            sim.camera.zoom = (sim.camera.zoom / 1.10).max(0.25);
                        }

                        _ => {}
                    }
                }
                Event::Mouse(m) => {
                    use crossterm::event::{MouseButton, MouseEventKind};
                    if let MouseEventKind::Down(MouseButton::Left) = m.kind {
                        if prev_w > 0 {
                            let (main_w, cx, cy, base_scale) = scene_metrics(prev_w, prev_h, &sim.registry);
                            if m.column < main_w {
                                if let Some(id) = pick_body(&sim, cx, cy, base_scale, m.column, m.row) {
                                    selected = id;
                                    sim.set_follow(Some(id));
                                }
                            }
                        }
                    }
                }
                _ => {}
            }
        }

        // asset results, applied between ticks
        while let Ok(ev) = assets.try_recv() {
            if let Some(cat) = sim.apply_asset(ev, log) {
                scene.catalog = Some(cat);
                if prev_w > 0 {
                    let (main_w, _, _, _) = scene_metrics(prev_w, prev_h, &sim.registry);
                    scene.rebuild_stars(main_w, prev_h, args.stars, args.seed);
                }
            }
        }

        // resize and (re)alloc buffers
        let (w, h) = terminal::size()?;
        if w < MIN_COLS || h < MIN_ROWS {
            execute!(out, BeginSynchronizedUpdate, terminal::Clear(ClearType::All))?;
            queue!(
                out,
                cursor::MoveTo(0, 0),
                SetForegroundColor(Color::Grey),
                Print(format!("Terminal too small (need {}x{}).", MIN_COLS, MIN_ROWS))
            )?;
            execute!(out, EndSynchronizedUpdate)?;
            out.flush()?;
            std::thread::sleep(Duration::from_millis(120));
            continue;
        }
        if w != prev_w || h != prev_h {
            prev_w = w;
            prev_h = h;
            prev_buf = vec![Cell::blank(Color::Black); (w as usize) * (h as usize)];
            cur_buf = vec![Cell::blank(Color::Black); (w as usize) * (h as usize)];
            execute!(out, terminal::Clear(ClearType::All))?;
            let (main_w, _, _, _) = scene_metrics(w, h, &sim.registry);
            scene.rebuild_stars(main_w, h, args.stars, args.seed);
        }

        let frame_start = Instant::now();
        let t_wall = start_time.elapsed().as_secs_f32();

        sim.tick(t_wall);
        scene.pulse(t_wall);
        if sim.state == RunState::Running {
            scene.push_trails(&sim.registry);
        }

        for c in cur_buf.iter_mut() {
            *c = Cell::blank(Color::Black);
        }
        let sim_date = epoch + chrono::Duration::milliseconds((sim.clock_days * 86_400_000.0) as i64);
        render_scene(&mut cur_buf, prev_w, prev_h, &sim, &scene, selected, t_wall, sim_date);

        execute!(out, BeginSynchronizedUpdate)?;
        render_diff(out, prev_w, prev_h, &mut prev_buf, &cur_buf)?;
        execute!(out, EndSynchronizedUpdate)?;
        out.flush()?;

        let elapsed = Instant::now() - frame_start;
        if elapsed < frame_dt {
            std::thread::sleep(frame_dt - elapsed);
        }
    }
}

// -------------------- Data --------------------
// Radii and speeds are scene units and rad/tick, tuned for motion that
// reads well at warp 1; speed ratios roughly follow the real periods.
// Negative speeds are retrograde (Venus and Uranus spin backwards; one
// of the ships flies against the flow).
fn default_system() -> Vec<BodyDesc> {
    vec![
        BodyDesc {
            name: "Sun",
            kind: BodyKind::Star,
            orbit_radius: 0.0,
            orbit_speed: 0.0,
            spin_speed: 0.0008,
            scale: 2.6,
            phase: Some(0.0),
            parent: None,
            lift: (0.0, 0.0),
            facts: BodyFacts {
                label: "The Sun",
                first_observed: "known to ancient observers",
                atmosphere: "hydrogen and helium plasma",
                trivia: "G2V star; everything here swings around it.",
            },
        },
        BodyDesc {
            name: "Mercury",
            kind: BodyKind::Planet,
            orbit_radius: 7.0,
            orbit_speed: 0.0240,
            spin_speed: 0.004,
            scale: 0.38,
            phase: None,
            parent: None,
            lift: (0.0, 0.0),
            facts: BodyFacts {
                label: "Mercury",
                first_observed: "known to ancient observers",
                atmosphere: "none (trace sodium, oxygen)",
                trivia: "Day longer than its year; extreme swings.",
            },
        },
        BodyDesc {
            name: "Venus",
            kind: BodyKind::Planet,
            orbit_radius: 10.0,
            orbit_speed: 0.0094,
            spin_speed: -0.002,
            scale: 0.95,
            phase: None,
            parent: None,
            lift: (0.0, 0.0),
            facts: BodyFacts {
                label: "Venus",
                first_observed: "known to ancient observers",
                atmosphere: "CO2 ~96%, sulfuric clouds",
                trivia: "Hottest planet; spins the wrong way round.",
            },
        },
        BodyDesc {
            name: "Earth",
            kind: BodyKind::Planet,
            orbit_radius: 14.0,
            orbit_speed: 0.0060,
            spin_speed: 0.02,
            scale: 1.0,
            phase: None,
            parent: None,
            lift: (0.0, 0.0),
            facts: BodyFacts {
                label: "Earth",
                first_observed: "known to ancient observers",
                atmosphere: "N2 ~78%, O2 ~21%",
                trivia: "Only world with confirmed surface water.",
            },
        },
        BodyDesc {
            name: "Luna",
            kind: BodyKind::Moon,
            orbit_radius: 2.2,
            orbit_speed: 0.0800,
            spin_speed: 0.0008,
            scale: 0.27,
            phase: None,
            parent: Some("Earth"),
            lift: (0.0, 0.0),
            facts: BodyFacts {
                label: "Luna",
                first_observed: "known to ancient observers",
                atmosphere: "none to speak of",
                trivia: "Rides along with Earth, always showing one face.",
            },
        },
        BodyDesc {
            name: "Mars",
            kind: BodyKind::Planet,
            orbit_radius: 18.0,
            orbit_speed: 0.0032,
            spin_speed: 0.018,
            scale: 0.53,
            phase: None,
            parent: None,
            lift: (0.0, 0.0),
            facts: BodyFacts {
                label: "Mars",
                first_observed: "known to ancient observers",
                atmosphere: "CO2 ~95%, thin",
                trivia: "Home to Olympus Mons, the largest volcano.",
            },
        },
        BodyDesc {
            name: "Jupiter",
            kind: BodyKind::Planet,
            orbit_radius: 26.0,
            orbit_speed: 0.00050,
            spin_speed: 0.045,
            scale: 2.2,
            phase: None,
            parent: None,
            lift: (0.0, 0.0),
            facts: BodyFacts {
                label: "Jupiter",
                first_observed: "known to ancient observers",
                atmosphere: "H2 ~90%, He ~10%",
                trivia: "The Great Red Spot is a very old storm.",
            },
        },
        BodyDesc {
            name: "Saturn",
            kind: BodyKind::Planet,
            orbit_radius: 34.0,
            orbit_speed: 0.00020,
            spin_speed: 0.038,
            scale: 1.9,
            phase: None,
            parent: None,
            lift: (0.0, 0.0),
            facts: BodyFacts {
                label: "Saturn",
                first_observed: "known to ancient observers",
                atmosphere: "H2 ~96%, He ~3%",
                trivia: "The rings are the whole show here.",
            },
        },
        BodyDesc {
            name: "Uranus",
            kind: BodyKind::Planet,
            orbit_radius: 41.0,
            orbit_speed: 0.00007,
            spin_speed: -0.03,
            scale: 1.4,
            phase: None,
            parent: None,
            lift: (0.0, 0.0),
            facts: BodyFacts {
                label: "Uranus",
                first_observed: "1781 (William Herschel)",
                atmosphere: "H2 ~83%, He ~15%, methane",
                trivia: "Tipped on its side; rolls along its orbit.",
            },
        },
        BodyDesc {
            name: "Neptune",
            kind: BodyKind::Planet,
            orbit_radius: 47.0,
            orbit_speed: 0.00004,
            spin_speed: 0.028,
            scale: 1.35,
            phase: None,
            parent: None,
            lift: (0.0, 0.0),
            facts: BodyFacts {
                label: "Neptune",
                first_observed: "1846 (predicted, then seen by Galle)",
                atmosphere: "H2 ~80%, He ~19%, methane",
                trivia: "Strongest winds anywhere in the system.",
            },
        },
        BodyDesc {
            name: "Kestrel",
            kind: BodyKind::Ship,
            orbit_radius: 22.0,
            orbit_speed: 0.0150,
            spin_speed: 0.0,
            scale: 0.3,
            phase: None,
            parent: None,
            lift: (1.8, 1.1),
            facts: BodyFacts {
                label: "SV Kestrel",
                first_observed: "launch day",
                atmosphere: "recycled, slightly stale",
                trivia: "Survey boat on a weaving inner-system run.",
            },
        },
        BodyDesc {
            name: "Meridian",
            kind: BodyKind::Ship,
            orbit_radius: 30.0,
            orbit_speed: -0.0110,
            spin_speed: 0.0,
            scale: 0.3,
            phase: None,
            parent: None,
            lift: (2.4, 0.9),
            facts: BodyFacts {
                label: "SV Meridian",
                first_observed: "launch day",
                atmosphere: "recycled, slightly stale",
                trivia: "Flies against the flow; the view is better.",
            },
        },
    ]
}

// -------------------- Tests --------------------
#[cfg(test)]
mod tests {
    use super::*;

    fn facts() -> BodyFacts {
        BodyFacts { label: "test body", first_observed: "-", atmosphere: "-", trivia: "-" }
    }

    fn desc(name: &'static str, radius: f32, orbit_speed: f32, spin_speed: f32, phase: f32) -> BodyDesc {
        BodyDesc {
            name,
            kind: BodyKind::Planet,
            orbit_radius: radius,
            orbit_speed,
            spin_speed,
            scale: 1.0,
            phase: Some(phase),
            parent: None,
            lift: (0.0, 0.0),
            facts: facts(),
        }
    }

    fn rng() -> StdRng {
        StdRng::seed_from_u64(7)
    }

    fn kinematic_bits(sim: &Sim) -> Vec<(u32, u32, [u32; 3])> {
        sim.registry
            .iter()
            .map(|b| {
                (
                    b.phase.to_bits(),
                    b.spin.to_bits(),
                    [b.position.x.to_bits(), b.position.y.to_bits(), b.position.z.to_bits()],
                )
            })
            .collect()
    }

    fn ring_bits(sim: &Sim) -> Vec<u32> {
        let rings = sim.rings.as_ref().unwrap();
        let mut out: Vec<u32> = rings.segments.iter().map(|s| s.rotation.to_bits()).collect();
        out.extend(rings.particles.iter().flat_map(|p| {
            [p.pos.x.to_bits(), p.pos.y.to_bits(), p.pos.z.to_bits()]
        }));
        out
    }

    #[test]
    fn phase_accumulation_is_linear() {
        let n = 50;
        let speed = 0.004f32;
        let mut stepped = 0.2f32;
        for _ in 0..n {
            stepped = advance_phase(stepped, speed, 1.0);
        }
        let jumped = advance_phase(0.2, speed * n as f32, 1.0);
        assert!((stepped - jumped).abs() < 1e-4, "{} vs {}", stepped, jumped);
    }

    #[test]
    fn wrap_keeps_in_range_and_is_identity_in_range() {
        assert!((wrap_phase(TAU + 0.5) - 0.5).abs() < 1e-6);
        assert!((wrap_phase(-0.1) - (TAU - 0.1)).abs() < 1e-6);
        let a = 1.234567f32;
        assert_eq!(wrap_phase(a).to_bits(), a.to_bits());
    }

    #[test]
    fn zero_warp_is_an_exact_freeze() {
        let mut r = rng();
        let mut sim = build_sim(&mut r).unwrap();
        sim.tick(0.1); // move off the initial state first
        assert!(sim.set_warp(0.0));
        let bodies_before = kinematic_bits(&sim);
        let rings_before = ring_bits(&sim);
        let ticks_before = sim.tick_count;
        for i in 0..25 {
            sim.tick(0.2 + i as f32);
        }
        assert_eq!(bodies_before, kinematic_bits(&sim));
        assert_eq!(rings_before, ring_bits(&sim));
        // bookkeeping stays alive at zero warp
        assert_eq!(sim.tick_count, ticks_before + 25);
    }

    #[test]
    fn pause_freezes_kinematics_while_glow_keeps_breathing() {
        let mut r = rng();
        let mut sim = build_sim(&mut r).unwrap();
        sim.tick(0.1);
        sim.pause();
        let before = kinematic_bits(&sim);
        let ticks_before = sim.tick_count;

        sim.tick(1.0);
        let glow_early = sim.rings.as_ref().unwrap().glow[0].opacity;
        sim.tick(5.0);
        let glow_late = sim.rings.as_ref().unwrap().glow[0].opacity;

        assert_eq!(before, kinematic_bits(&sim));
        assert_eq!(sim.tick_count, ticks_before);
        assert!((glow_early - glow_late).abs() > 1e-4, "glow should follow the wall clock while paused");

        sim.resume();
        sim.tick(6.0);
        assert_ne!(before, kinematic_bits(&sim));
    }

    #[test]
    fn moon_rides_on_its_parent_every_tick() {
        let mut r = rng();
        let mut sim = build_sim(&mut r).unwrap();
        let earth = sim.registry.find("Earth").unwrap();
        let moon = sim.registry.find("Luna").unwrap();
        sim.set_warp(3.7);
        for i in 0..500 {
            sim.tick(i as f32 * 0.03);
            let e = sim.registry.bodies[earth].position;
            let m = sim.registry.bodies[moon].position;
            let own = orbit_offset(sim.registry.bodies[moon].phase, sim.registry.bodies[moon].orbit_radius);
            let err = m.sub(e).sub(own).len();
            assert!(err < 1e-3, "tick {}: moon offset error {}", i, err);
        }
    }

    #[test]
    fn ring_rotation_ignores_retrograde_planet_spin() {
        let mut r = rng();
        let mut reg = Registry::new();
        let id = reg.register(desc("Ringed", 10.0, 0.002, -0.02, 0.0), &mut r).unwrap();
        let pal = fallback_palette("Ringed");
        let rings = RingAssembly::build(id, &pal, &mut r);
        let mut sim = Sim::new(reg, Some(rings));

        let mut last: Vec<f32> = sim.rings.as_ref().unwrap().segments.iter().map(|s| s.rotation).collect();
        for i in 0..10 {
            sim.tick(i as f32);
            let planet_spin = sim.registry.bodies[id].spin;
            assert!(planet_spin < 0.0);
            for (seg, prev) in sim.rings.as_ref().unwrap().segments.iter().zip(last.iter()) {
                assert!(seg.rotation > *prev, "segment rotation must advance in its own direction");
            }
            last = sim.rings.as_ref().unwrap().segments.iter().map(|s| s.rotation).collect();
        }
    }

    #[test]
    fn camera_converges_on_a_stationary_target() {
        let mut r = rng();
        let mut reg = Registry::new();
        let id = reg.register(desc("Anchor", 10.0, 0.0, 0.0, 0.0), &mut r).unwrap();
        let mut sim = Sim::new(reg, None);
        sim.set_follow(Some(id));
        for i in 0..300 {
            sim.tick(i as f32 * 0.01);
        }
        let target = sim.registry.bodies[id].position.add(FOLLOW_OFFSET);
        let err = sim.camera.focus.sub(target).len();
        assert!(err < 0.01, "camera should be {} away at most, was {}", 0.01, err);
    }

    #[test]
    fn camera_trails_a_moving_target_within_bound() {
        let mut r = rng();
        let mut reg = Registry::new();
        let id = reg.register(desc("Runner", 10.0, 0.01, 0.0, 0.0), &mut r).unwrap();
        let mut sim = Sim::new(reg, None);
        sim.set_follow(Some(id));
        let mut err_mid = 0.0;
        for i in 0..2000 {
            sim.tick(i as f32 * 0.01);
            if i == 1500 {
                let t = sim.registry.bodies[id].position.add(FOLLOW_OFFSET);
                err_mid = sim.camera.focus.sub(t).len();
            }
        }
        let target = sim.registry.bodies[id].position.add(FOLLOW_OFFSET);
        let err = sim.camera.focus.sub(target).len();
        // per-tick target displacement is about radius * speed = 0.1;
        // a 0.05 lerp settles near d*(1-f)/f, so give it a little slack
        assert!(err < 2.5, "steady-state lag too large: {}", err);
        assert!((err - err_mid).abs() < 0.5, "lag should be steady: {} vs {}", err_mid, err);
    }

    #[test]
    fn hundred_ticks_lands_where_expected() {
        let mut r = rng();
        let mut reg = Registry::new();
        let id = reg.register(desc("Probe", 100.0, 0.01, 0.0, 0.0), &mut r).unwrap();
        let mut sim = Sim::new(reg, None);
        for _ in 0..100 {
            sim.tick(0.0);
        }
        let body = &sim.registry.bodies[id];
        assert!((body.phase - 1.0).abs() < 1e-3, "phase {}", body.phase);
        assert!((body.position.x - 54.03).abs() < 0.05, "x {}", body.position.x);
        assert!(body.position.y.abs() < 1e-6);
        assert!((body.position.z - 84.15).abs() < 0.05, "z {}", body.position.z);
    }

    #[test]
    fn missing_palette_leaves_the_body_fully_alive() {
        let mut r = rng();
        let mut sim = build_sim(&mut r).unwrap();
        let mut log = SessionLog::open(None);
        sim.apply_asset(
            AssetEvent::Palette { body: "Mars".to_string(), result: Err("no such file".to_string()) },
            &mut log,
        );

        let mars = sim.registry.find("Mars").expect("Mars stays registered");
        assert_eq!(sim.registry.bodies[mars].palette, fallback_palette("Mars"));
        assert!(!sim.registry.bodies[mars].palette_loaded);

        let phase_before = sim.registry.bodies[mars].phase;
        sim.tick(0.0);
        assert!(sim.registry.bodies[mars].phase != phase_before);

        // still clickable exactly where it projects
        let (w, h) = (140u16, 45u16);
        let (_, cx, cy, base_scale) = scene_metrics(w, h, &sim.registry);
        let (sx, sy, _) = project(sim.registry.bodies[mars].position, &sim.camera, cx, cy, base_scale);
        let hit = pick_body(&sim, cx, cy, base_scale, sx.round() as u16, sy.round() as u16);
        assert!(hit.is_some());
    }

    #[test]
    fn pointer_select_returns_the_nearest_body() {
        let mut r = rng();
        let mut reg = Registry::new();
        let near = reg.register(desc("Near", 10.0, 0.0, 0.0, 0.0), &mut r).unwrap();
        let far = reg.register(desc("Far", 40.0, 0.0, 0.0, PI), &mut r).unwrap();
        let sim = Sim::new(reg, None);

        let (w, h) = (140u16, 45u16);
        let (_, cx, cy, base_scale) = scene_metrics(w, h, &sim.registry);

        let (sx, sy, _) = project(sim.registry.bodies[near].position, &sim.camera, cx, cy, base_scale);
        assert_eq!(pick_body(&sim, cx, cy, base_scale, sx.round() as u16, sy.round() as u16), Some(near));

        let (fx, fy, _) = project(sim.registry.bodies[far].position, &sim.camera, cx, cy, base_scale);
        assert_eq!(pick_body(&sim, cx, cy, base_scale, fx.round() as u16, fy.round() as u16), Some(far));

        // empty space misses
        assert_eq!(pick_body(&sim, cx, cy, base_scale, 1, 1), None);
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let mut r = rng();
        let mut reg = Registry::new();
        reg.register(desc("Twin", 5.0, 0.01, 0.0, 0.0), &mut r).unwrap();
        let before = reg.len();
        assert!(reg.register(desc("Twin", 9.0, 0.02, 0.0, 0.0), &mut r).is_err());
        assert_eq!(reg.len(), before);
        assert_eq!(reg.bodies[reg.find("Twin").unwrap()].orbit_radius, 5.0);
    }

    #[test]
    fn dangling_parent_is_rejected() {
        let mut r = rng();
        let mut reg = Registry::new();
        let mut d = desc("Stray", 2.0, 0.05, 0.0, 0.0);
        d.kind = BodyKind::Moon;
        d.parent = Some("Nowhere");
        assert!(reg.register(d, &mut r).is_err());
        assert_eq!(reg.len(), 0);
    }

    #[test]
    fn registration_order_is_iteration_order() {
        let mut r = rng();
        let mut reg = Registry::new();
        for name in ["C", "A", "B"] {
            reg.register(desc(name, 5.0, 0.01, 0.0, 0.0), &mut r).unwrap();
        }
        let names: Vec<&str> = reg.iter().map(|b| b.name).collect();
        assert_eq!(names, vec!["C", "A", "B"]);
        assert_eq!(reg.find("A"), Some(1));
        assert_eq!(reg.find("Z"), None);
    }

    #[test]
    fn bad_configuration_keeps_the_previous_value() {
        let mut r = rng();
        let mut sim = build_sim(&mut r).unwrap();
        sim.set_warp(2.5);
        assert!(!sim.set_warp(-1.0));
        assert!(!sim.set_warp(f32::NAN));
        assert!((sim.warp - 2.5).abs() < 1e-6);

        sim.set_body_scale(1.5);
        assert!(!sim.set_body_scale(0.0));
        assert!(!sim.set_body_scale(-3.0));
        assert!((sim.body_scale - 1.5).abs() < 1e-6);

        sim.set_follow(Some(usize::MAX));
        assert_eq!(sim.camera.follow, None);
    }

    #[test]
    fn ship_weave_and_bank_follow_the_track() {
        let phase = 0.8f32;
        let (a, b) = (1.8f32, 1.1f32);
        let lift = ship_lift(phase, a, b);
        assert!((lift - ((phase * 3.0).sin() * a + (phase * 1.5).cos() * b)).abs() < 1e-6);

        let (heading, roll) = ship_attitude(phase, 22.0, a, b);
        assert!(heading.len() > 0.0, "look-ahead heading must be non-degenerate");
        assert!((roll - (phase * 2.0).sin() * SHIP_BANK_GAIN).abs() < 1e-6);
    }

    #[test]
    fn absent_asset_directory_resolves_to_fallbacks() {
        let rx = spawn_asset_loads(PathBuf::from("no-such-assets-dir"), vec!["Mars".to_string()]);
        let mut saw_palette_err = false;
        let mut saw_backdrop_err = false;
        for _ in 0..2 {
            match rx.recv_timeout(Duration::from_secs(5)).expect("loader must answer") {
                AssetEvent::Palette { body, result } => {
                    assert_eq!(body, "Mars");
                    saw_palette_err = result.is_err();
                }
                AssetEvent::Backdrop { result } => saw_backdrop_err = result.is_err(),
            }
        }
        assert!(saw_palette_err && saw_backdrop_err);
    }

    #[test]
    fn procedural_backdrop_exists_from_the_first_frame() {
        let scene = Scene::build(100, 40, 0, 99, None, 3);
        assert!(!scene.stars.is_empty());

        let catalog = BackdropCatalog {
            stars: vec![
                CatalogStar { x: 0.1, y: 0.2, depth: 0.9 },
                CatalogStar { x: 0.8, y: 0.6, depth: 0.4 },
            ],
        };
        let scene = Scene::build(100, 40, 0, 99, Some(catalog), 3);
        assert_eq!(scene.stars.len(), 2);
    }

    #[test]
    fn body_scale_rescales_every_hit_zone_uniformly() {
        let mut r = rng();
        let mut reg = Registry::new();
        let id = reg.register(desc("Dot", 20.0, 0.0, 0.0, 0.0), &mut r).unwrap();
        let mut sim = Sim::new(reg, None);
        let (w, h) = (140u16, 45u16);
        let (_, cx, cy, base_scale) = scene_metrics(w, h, &sim.registry);
        let (sx, sy, _) = project(sim.registry.bodies[id].position, &sim.camera, cx, cy, base_scale);

        // a click 4 cells off misses at scale 1 and hits once bodies grow
        let off = (sx + 4.0).round() as u16;
        assert_eq!(pick_body(&sim, cx, cy, base_scale, off, sy.round() as u16), None);
        assert!(sim.set_body_scale(4.0));
        assert_eq!(pick_body(&sim, cx, cy, base_scale, off, sy.round() as u16), Some(id));
    }
}
