#![no_main]
use libfuzzer_sys::fuzz_target;
use zerofeed::devices::modbus_meter::{RegisterType, decode_register_watts};

fuzz_target!(|data: &[u8]| {
    // Interpret the input as u16 register stream in big-endian pairs
    let mut regs = Vec::new();
    let mut it = data.chunks_exact(2);
    for b in &mut it {
        regs.push(u16::from_be_bytes([b[0], b[1]]));
    }

    // Exercise the decoder under varying lengths and scales
    let _ = decode_register_watts(&regs, RegisterType::Int16, 1.0);
    let _ = decode_register_watts(&regs, RegisterType::Int32, 0.1);
    let _ = decode_register_watts(&regs, RegisterType::Uint16, 10.0);
});
