use rand::distributions::Alphanumeric;
use rand::Rng;
use uuid::Uuid;

pub fn uuid() -> String {
    Uuid::new_v4().to_string()
}

pub fn rand_string(n: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(n)
        .map(char::from)
        .collect::<String>()
        .to_lowercase()
}

pub fn rand_u32() -> u32 {
    rand::thread_rng().gen()
}

/// A random even port inside `[base, base + span)`, suitable for an RTP
/// socket (RTCP convention reserves the odd port above it).
pub fn rand_even_port(base: u16, span: u16) -> u16 {
    let span = span.max(2);
    let port = base + rand::thread_rng().gen_range(0..span / 2) * 2;
    port & !1
}
