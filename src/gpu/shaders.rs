//! WGSL compute kernels of one simulation step
//!
//! Arenas are flat `array<f32>` with the three axis blocks `stride` slots
//! apart, exactly as [`crate::atom::AtomSet`] lays them out. Bindings 0-3 are
//! the current and alternate position/velocity arenas; the host swaps which
//! physical buffer sits behind each binding to flip ping-pong sides.

/// Declarations and helpers shared by every kernel
pub const TYPES: &str = r#"
struct Uniforms {
    begin: u32,
    end: u32,
    active_end: u32,
    stride: u32,
    boxes_x: u32,
    boxes_y: u32,
    boxes_z: u32,
    total_boxes: u32,
    min_border_x: f32,
    min_border_y: f32,
    min_border_z: f32,
    inv_box: f32,
    min_ext_x: f32,
    min_ext_y: f32,
    min_ext_z: f32,
    dt: f32,
    max_ext_x: f32,
    max_ext_y: f32,
    max_ext_z: f32,
    sigma2: f32,
    gravity_x: f32,
    gravity_y: f32,
    gravity_z: f32,
    epsilon: f32,
    cutoff2: f32,
    radius: f32,
    _pad0: f32,
    _pad1: f32,
}

@group(0) @binding(0) var<storage, read_write> pos_cur: array<f32>;
@group(0) @binding(1) var<storage, read_write> vel_cur: array<f32>;
@group(0) @binding(2) var<storage, read_write> pos_alt: array<f32>;
@group(0) @binding(3) var<storage, read_write> vel_alt: array<f32>;
@group(0) @binding(4) var<storage, read_write> counts: array<atomic<u32>>;
@group(0) @binding(5) var<storage, read_write> offsets: array<u32>;
@group(0) @binding(6) var<storage, read_write> box_cursor: array<atomic<u32>>;
@group(0) @binding(7) var<storage, read_write> status: atomic<u32>;
@group(0) @binding(8) var<uniform> u: Uniforms;

fn pos_get(i: u32) -> vec3<f32> {
    return vec3<f32>(pos_cur[i], pos_cur[i + u.stride], pos_cur[i + 2u * u.stride]);
}

fn pos_set(i: u32, p: vec3<f32>) {
    pos_cur[i] = p.x;
    pos_cur[i + u.stride] = p.y;
    pos_cur[i + 2u * u.stride] = p.z;
}

fn vel_get(i: u32) -> vec3<f32> {
    return vec3<f32>(vel_cur[i], vel_cur[i + u.stride], vel_cur[i + 2u * u.stride]);
}

fn vel_set(i: u32, v: vec3<f32>) {
    vel_cur[i] = v.x;
    vel_cur[i + u.stride] = v.y;
    vel_cur[i + 2u * u.stride] = v.z;
}

fn pos_alt_set(i: u32, p: vec3<f32>) {
    pos_alt[i] = p.x;
    pos_alt[i + u.stride] = p.y;
    pos_alt[i + 2u * u.stride] = p.z;
}

fn vel_alt_set(i: u32, v: vec3<f32>) {
    vel_alt[i] = v.x;
    vel_alt[i + u.stride] = v.y;
    vel_alt[i + 2u * u.stride] = v.z;
}

fn box_coords(p: vec3<f32>) -> vec3<i32> {
    let lo = vec3<f32>(u.min_border_x, u.min_border_y, u.min_border_z);
    return vec3<i32>(floor((p - lo) * u.inv_box));
}

fn in_grid(c: vec3<i32>) -> bool {
    let n = vec3<i32>(i32(u.boxes_x), i32(u.boxes_y), i32(u.boxes_z));
    return all(c >= vec3<i32>(0)) && all(c < n);
}

fn box_id(c: vec3<i32>) -> u32 {
    return u32(c.x) + u32(c.y) * u.boxes_x + u32(c.z) * u.boxes_x * u.boxes_y;
}

fn lennard_jones(r2: f32) -> f32 {
    let rr2 = 1.0 / r2;
    let s = u.sigma2 * rr2;
    let r6 = s * s * s;
    return 24.0 * u.epsilon * rr2 * (2.0 * r6 * r6 - r6);
}

fn pair_force(pi: vec3<f32>, pj: vec3<f32>) -> vec3<f32> {
    let d = pi - pj;
    let r2 = d.x * d.x + d.y * d.y + d.z * d.z;
    if (r2 < u.cutoff2 && r2 > 0.0) {
        return lennard_jones(r2) * d;
    }
    return vec3<f32>(0.0);
}
"#;

/// Constant acceleration on own atoms
pub const GRAVITY: &str = r#"
@compute @workgroup_size(256)
fn gravity(@builtin(global_invocation_id) gid: vec3<u32>) {
    let i = u.begin + gid.x;
    if (i >= u.end) {
        return;
    }
    let g = vec3<f32>(u.gravity_x, u.gravity_y, u.gravity_z);
    vel_set(i, vel_get(i) + g * u.dt);
}
"#;

/// Box pass: clear, count, scan and scatter
pub const BOX_PASS: &str = r#"
@compute @workgroup_size(256)
fn clear_boxes(@builtin(global_invocation_id) gid: vec3<u32>) {
    if (gid.x >= u.total_boxes) {
        return;
    }
    atomicStore(&counts[gid.x], 0u);
}

@compute @workgroup_size(256)
fn count_boxes(@builtin(global_invocation_id) gid: vec3<u32>) {
    let i = u.begin + gid.x;
    if (i >= u.end) {
        return;
    }
    let c = box_coords(pos_get(i));
    if (!in_grid(c)) {
        atomicStore(&status, 1u);
        return;
    }
    atomicAdd(&counts[box_id(c)], 1u);
}

var<workgroup> chunk_sums: array<u32, 256>;

// One workgroup: each thread sums a contiguous chunk of boxes, thread 0
// scans the chunk sums, then every thread writes its chunk's offsets.
@compute @workgroup_size(256)
fn scan_boxes(@builtin(local_invocation_id) lid: vec3<u32>) {
    let t = lid.x;
    let chunk = (u.total_boxes + 255u) / 256u;
    let first = min(t * chunk, u.total_boxes);
    let last = min(first + chunk, u.total_boxes);

    var sum = 0u;
    for (var b = first; b < last; b = b + 1u) {
        sum = sum + atomicLoad(&counts[b]);
    }
    chunk_sums[t] = sum;
    workgroupBarrier();

    if (t == 0u) {
        var acc = 0u;
        for (var k = 0u; k < 256u; k = k + 1u) {
            let c = chunk_sums[k];
            chunk_sums[k] = acc;
            acc = acc + c;
        }
        offsets[u.total_boxes] = acc;
    }
    workgroupBarrier();

    var acc = chunk_sums[t];
    for (var b = first; b < last; b = b + 1u) {
        offsets[b] = acc;
        atomicStore(&box_cursor[b], acc);
        acc = acc + atomicLoad(&counts[b]);
    }
}

@compute @workgroup_size(256)
fn scatter_boxes(@builtin(global_invocation_id) gid: vec3<u32>) {
    let i = gid.x;
    if (i >= u.active_end) {
        return;
    }
    let p = pos_get(i);
    let v = vel_get(i);
    if (i < u.begin || i >= u.end) {
        pos_alt_set(i, p);
        vel_alt_set(i, v);
        return;
    }
    let c = box_coords(p);
    if (!in_grid(c)) {
        return;
    }
    let dst = u.begin + atomicAdd(&box_cursor[box_id(c)], 1u);
    pos_alt_set(dst, p);
    vel_alt_set(dst, v);
}
"#;

/// Lennard-Jones force, O(n²) and box-indexed
pub const FORCE: &str = r#"
@compute @workgroup_size(256)
fn force_all_pairs(@builtin(global_invocation_id) gid: vec3<u32>) {
    let i = u.begin + gid.x;
    if (i >= u.end) {
        return;
    }
    let pi = pos_get(i);
    var acc = vec3<f32>(0.0);
    for (var j = 0u; j < u.active_end; j = j + 1u) {
        if (j != i) {
            acc = acc + pair_force(pi, pos_get(j));
        }
    }
    vel_set(i, vel_get(i) + acc * u.dt);
}

@compute @workgroup_size(256)
fn force_boxed(@builtin(global_invocation_id) gid: vec3<u32>) {
    let i = u.begin + gid.x;
    if (i >= u.end) {
        return;
    }
    let pi = pos_get(i);
    let c = box_coords(pi);
    var acc = vec3<f32>(0.0);

    let z_hi = min(c.z + 1, i32(u.boxes_z) - 1);
    let y_hi = min(c.y + 1, i32(u.boxes_y) - 1);
    let x_hi = min(c.x + 1, i32(u.boxes_x) - 1);
    for (var z = max(c.z - 1, 0); z <= z_hi; z = z + 1) {
        for (var y = max(c.y - 1, 0); y <= y_hi; y = y + 1) {
            for (var x = max(c.x - 1, 0); x <= x_hi; x = x + 1) {
                let b = box_id(vec3<i32>(x, y, z));
                let last = u.begin + offsets[b + 1u];
                for (var j = u.begin + offsets[b]; j < last; j = j + 1u) {
                    if (j != i) {
                        acc = acc + pair_force(pi, pos_get(j));
                    }
                }
            }
        }
    }

    for (var j = 0u; j < u.begin; j = j + 1u) {
        acc = acc + pair_force(pi, pos_get(j));
    }
    for (var j = u.end; j < u.active_end; j = j + 1u) {
        acc = acc + pair_force(pi, pos_get(j));
    }
    vel_set(i, vel_get(i) + acc * u.dt);
}
"#;

/// Elastic bounce, border reflection and position update
pub const MOTION: &str = r#"
@compute @workgroup_size(256)
fn collision(@builtin(global_invocation_id) gid: vec3<u32>) {
    let i = gid.x;
    if (i >= u.active_end) {
        return;
    }
    let vi = vel_get(i);
    if (i < u.begin || i >= u.end) {
        vel_alt_set(i, vi);
        return;
    }
    let pi = pos_get(i);
    let contact2 = (2.0 * u.radius) * (2.0 * u.radius);
    var bounced = vi;
    for (var j = 0u; j < u.active_end; j = j + 1u) {
        if (j == i) {
            continue;
        }
        let d = pi - pos_get(j);
        let r2 = d.x * d.x + d.y * d.y + d.z * d.z;
        if (r2 >= contact2 || r2 == 0.0) {
            continue;
        }
        let dv = vi - vel_get(j);
        let approach = dv.x * d.x + dv.y * d.y + dv.z * d.z;
        if (approach < 0.0) {
            bounced = bounced - (approach / r2) * d;
        }
    }
    vel_alt_set(i, bounced);
}

@compute @workgroup_size(256)
fn border(@builtin(global_invocation_id) gid: vec3<u32>) {
    let i = u.begin + gid.x;
    if (i >= u.end) {
        return;
    }
    let lo = vec3<f32>(u.min_ext_x, u.min_ext_y, u.min_ext_z);
    let hi = vec3<f32>(u.max_ext_x, u.max_ext_y, u.max_ext_z);
    let p = pos_get(i);
    let v = vel_get(i);
    let outside = (p < lo) | (p > hi);
    pos_set(i, clamp(p, lo, hi));
    vel_set(i, select(v, -v, outside));
}

@compute @workgroup_size(256)
fn integrate(@builtin(global_invocation_id) gid: vec3<u32>) {
    let i = u.begin + gid.x;
    if (i >= u.end) {
        return;
    }
    pos_set(i, pos_get(i) + vel_get(i) * u.dt);
}
"#;

/// Every kernel in one module
pub fn step_shader() -> String {
    [TYPES, GRAVITY, BOX_PASS, FORCE, MOTION].concat()
}

/// Entry points of [`step_shader`]
pub const ENTRY_POINTS: [&str; 10] = [
    "gravity",
    "clear_boxes",
    "count_boxes",
    "scan_boxes",
    "scatter_boxes",
    "force_all_pairs",
    "force_boxed",
    "collision",
    "border",
    "integrate",
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_entry_point_is_declared_once() {
        let source = step_shader();
        for entry in ENTRY_POINTS {
            let decl = format!("fn {entry}(");
            assert_eq!(source.matches(&decl).count(), 1, "{entry}");
        }
    }

    #[test]
    fn kernels_share_the_workgroup_size() {
        let source = step_shader();
        assert_eq!(
            source.matches("@workgroup_size(256)").count(),
            ENTRY_POINTS.len()
        );
    }
}
