// The five benchmark kernels compiled and run under many optimization toggle sets. Each
// kernel returns its result modulo 256 and is checked against the same computation done
// in Rust with C's 32-bit wrapping semantics. Five toggles that touch the most code paths
// (register caching, compare fusion, strength reduction, magic division and deferred
// stores) are run through their full powerset; the other sets come from a fixed LCG
// walk over all 2^16 combinations, plus the named none/standard/all presets. Each set
// gets a fresh context so a failure names the exact flags that broke. A sixth, floating
// point kernel is compared within a relative tolerance instead, since a fused
// multiply-add rounds once where the separate multiply and add round twice.

//! Benchmark kernels under every interesting optimization combination.

use c2jit::{compile_str, get_entry, CompileOptions, Context, MessageSink, OptFlags};

const ACCUMULATE: &str = "int main() {
  int sum = 0;
  for (int i = 1; i <= 100000; i++) {
    int v = (i * 7 + 13) % 1000;
    sum = sum + v;
  }
  return sum % 256;
}
";

const COLLATZ: &str = "int main() {
  int total = 0;
  for (int n = 1; n <= 1000; n++) {
    int x = n;
    while (x != 1) {
      if (x % 2 == 0) x = x / 2;
      else x = 3 * x + 1;
      total = total + 1;
    }
  }
  return total % 256;
}
";

const GCD_SUM: &str = "int main() {
  int sum = 0;
  for (int i = 1; i <= 100; i++) {
    for (int j = 1; j <= 100; j++) {
      int a = i, b = j;
      while (b != 0) {
        int t = b;
        b = a % b;
        a = t;
      }
      sum = sum + a;
    }
  }
  return sum % 256;
}
";

const PRIME_COUNT: &str = "int main() {
  int count = 0;
  for (int n = 2; n <= 10000; n++) {
    int is_prime = 1;
    for (int d = 2; d * d <= n; d++) {
      if (n % d == 0) { is_prime = 0; break; }
    }
    if (is_prime) count = count + 1;
  }
  return count % 256;
}
";

const BITOPS: &str = "int main() {
  int x = 0x12345678;
  for (int i = 0; i < 100000; i++) {
    x = x ^ (x << 13);
    x = x ^ (x >> 17);
    x = x ^ (x << 5);
    x = x & 0x7fffffff;
  }
  return x % 256;
}
";

const HORNER: &str = "double horner(void) {
  double sum = 0.0;
  for (int i = 0; i < 2000; i++) {
    double x = i * 0.0005;
    double p = 1.5;
    p = p * x + 0.75;
    p = p * x - 2.25;
    p = p * x + 3.0;
    p = p * x + 0.125;
    sum = sum + p * 0.5;
  }
  return sum;
}
int main() { return (int) horner() % 256; }
";

fn horner() -> f64 {
    let mut sum = 0.0f64;
    for i in 0..2000 {
        let x = f64::from(i) * 0.0005;
        let mut p = 1.5f64;
        p = p * x + 0.75;
        p = p * x - 2.25;
        p = p * x + 3.0;
        p = p * x + 0.125;
        sum += p * 0.5;
    }
    sum
}

fn accumulate() -> i32 {
    let sum: i32 = (1..=100_000).map(|i: i32| (i * 7 + 13) % 1000).sum();
    sum % 256
}

fn collatz() -> i32 {
    let mut total = 0i32;
    for n in 1..=1000i32 {
        let mut x = n;
        while x != 1 {
            x = if x % 2 == 0 { x / 2 } else { 3 * x + 1 };
            total += 1;
        }
    }
    total % 256
}

fn gcd_sum() -> i32 {
    let mut sum = 0i32;
    for i in 1..=100i32 {
        for j in 1..=100i32 {
            let (mut a, mut b) = (i, j);
            while b != 0 {
                let t = b;
                b = a % b;
                a = t;
            }
            sum += a;
        }
    }
    sum % 256
}

fn prime_count() -> i32 {
    let count = (2..=10_000i32)
        .filter(|&n| (2..).take_while(|d| d * d <= n).all(|d| n % d != 0))
        .count() as i32;
    count % 256
}

fn bitops() -> i32 {
    let mut x: i32 = 0x1234_5678;
    for _ in 0..100_000 {
        x ^= x.wrapping_shl(13);
        x ^= x >> 17;
        x ^= x.wrapping_shl(5);
        x &= 0x7fff_ffff;
    }
    x % 256
}

fn kernels() -> Vec<(&'static str, &'static str, i32)> {
    vec![
        ("accumulate", ACCUMULATE, accumulate()),
        ("collatz", COLLATZ, collatz()),
        ("gcd_sum", GCD_SUM, gcd_sum()),
        ("prime_count", PRIME_COUNT, prime_count()),
        ("bitops", BITOPS, bitops()),
    ]
}

fn run(source: &str, name: &str, opt: OptFlags) -> i32 {
    let opts = CompileOptions {
        message_sink: MessageSink::capture(),
        opt,
        ..Default::default()
    };
    let mut ctx = Context::default();
    assert!(
        compile_str(&mut ctx, &opts, source, name),
        "{name} failed to compile with {:?}: {}",
        opt.enabled_names(),
        opts.message_sink.contents()
    );
    let main = get_entry(&ctx, "main").expect("main compiled");
    unsafe { main.call(0, std::ptr::null_mut()) }
}

fn check_all(opt: OptFlags, expected: &[(&'static str, &'static str, i32)]) {
    for &(name, source, want) in expected {
        let got = run(source, name, opt);
        assert_eq!(got, want, "{name} with {:?}", opt.enabled_names());
    }
}

#[test]
fn test_reference_values() {
    assert_eq!(prime_count(), 1229 % 256);
    assert!(kernels().iter().all(|&(_, _, v)| (0..256).contains(&v)));
}

#[test]
fn test_named_presets() {
    let _ = env_logger::builder().is_test(true).try_init();
    let expected = kernels();
    for opt in [OptFlags::none(), OptFlags::standard(), OptFlags::all()] {
        check_all(opt, &expected);
    }
}

#[test]
fn test_powerset_of_core_toggles() {
    let _ = env_logger::builder().is_test(true).try_init();
    let expected = kernels();
    for mask in 0..32u32 {
        let opt = OptFlags {
            reg_cache: mask & 1 != 0,
            cmp_branch: mask & 2 != 0,
            strength_reduce: mask & 4 != 0,
            magic_div: mask & 8 != 0,
            defer_store: mask & 16 != 0,
            ..OptFlags::none()
        };
        check_all(opt, &expected);
    }
}

#[test]
fn test_sampled_toggle_combinations() {
    let _ = env_logger::builder().is_test(true).try_init();
    let expected = kernels();
    let full = (1u32 << OptFlags::COUNT) - 1;
    let mut state: u32 = 0x2545_f491;
    for _ in 0..48 {
        state = state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
        let opt = OptFlags::from_bits((state >> 8) & full);
        check_all(opt, &expected);
    }
}

#[test]
fn test_each_toggle_alone() {
    let _ = env_logger::builder().is_test(true).try_init();
    let expected = kernels();
    for bit in 0..OptFlags::COUNT {
        let opt = OptFlags::from_bits(1 << bit);
        assert_eq!(opt.enabled_names().len(), 1);
        check_all(opt, &expected);
    }
}

fn run_horner(opt: OptFlags) -> f64 {
    let opts = CompileOptions {
        message_sink: MessageSink::capture(),
        opt,
        ..Default::default()
    };
    let mut ctx = Context::default();
    assert!(compile_str(&mut ctx, &opts, HORNER, "horner.c"), "{}", opts.message_sink.contents());
    let entry = get_entry(&ctx, "horner").expect("horner compiled");
    // SAFETY: horner takes no arguments and returns a double.
    let f: extern "C" fn() -> f64 = unsafe { std::mem::transmute(entry.addr() as usize) };
    f()
}

#[test]
fn test_float_kernel_within_tolerance() {
    let _ = env_logger::builder().is_test(true).try_init();
    let want = horner();
    let mut sets = vec![OptFlags::none(), OptFlags::standard(), OptFlags::all()];
    sets.extend((0..OptFlags::COUNT).map(|bit| OptFlags::from_bits(1 << bit)));
    for opt in sets {
        let got = run_horner(opt);
        let err = ((got - want) / want).abs();
        assert!(err < 1e-12, "horner with {:?}: {got} vs {want}", opt.enabled_names());
        if !opt.fmadd {
            // Every other toggle keeps the two roundings of a multiply and an add.
            assert_eq!(got, want, "horner with {:?}", opt.enabled_names());
        }
    }
}
