use std::ffi::CStr;
use std::io::{self, Write};

use recstore::packets::MarketShare;
use recstore::ProcessDescriptor;

const BAR_WIDTH: usize = 50;

/// Section header: a blank line, a bar, then `text`.
pub fn prompt<W: Write>(out: &mut W, text: &str) -> io::Result<()> {
    writeln!(out)?;
    writeln!(out, "{}", "=".repeat(BAR_WIDTH))?;
    writeln!(out, "{}", text)
}

pub fn records<W: Write>(out: &mut W, records: &[MarketShare]) -> io::Result<()> {
    prompt(
        out,
        &format!(
            "{:>7} | {:>6} | {:>7} | {:>6} | {:>6}",
            "Month#", "Android%", "iOS%", "Kaios%", "Other%"
        ),
    )?;
    for r in records {
        writeln!(
            out,
            "{:>7} | {:>7.2}% | {:>6.2}% | {:>5.2}% | {:>5.2}%",
            r.month, r.android, r.ios, r.kaios, r.other
        )?;
    }
    prompt(out, "")
}

pub fn processes<W: Write>(out: &mut W, live: usize, table: &[ProcessDescriptor]) -> io::Result<()> {
    writeln!(out, "{} client(s) connected.", live)?;
    writeln!(out)?;
    writeln!(out, "{:>5} |#CMDS|      Start Time     |   Last CMD Time", "PID")?;
    for p in table {
        writeln!(
            out,
            "{} | {:>3} | {} | {}",
            p.pid,
            p.command_count,
            local_time(p.start_time),
            local_time(p.last_command_time)
        )?;
    }
    Ok(())
}

/// `YYYY-MM-DD.HH:MM:SS` in the local time zone.
pub fn local_time(secs: i64) -> String {
    let t = secs as libc::time_t;
    let mut tm: libc::tm = unsafe { std::mem::zeroed() };
    if unsafe { libc::localtime_r(&t, &mut tm) }.is_null() {
        return secs.to_string();
    }
    let mut buf = [0 as libc::c_char; 64];
    let written = unsafe {
        libc::strftime(buf.as_mut_ptr(), buf.len(), b"%Y-%m-%d.%X\0".as_ptr().cast(), &tm)
    };
    if written == 0 {
        return secs.to_string();
    }
    unsafe { CStr::from_ptr(buf.as_ptr()) }.to_string_lossy().into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn render<F: FnOnce(&mut Vec<u8>) -> io::Result<()>>(f: F) -> String {
        let mut out = Vec::new();
        f(&mut out).unwrap();
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn record_rows_line_up_under_the_header() {
        let text = render(|out| {
            records(
                out,
                &[MarketShare { month: 3, android: 72.5, ios: 26.75, kaios: 0.5, other: 0.25 }],
            )
        });
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[2], " Month# | Android% |    iOS% | Kaios% | Other%");
        assert_eq!(lines[3], "      3 |   72.50% |  26.75% |  0.50% |  0.25%");
    }

    #[test]
    fn process_table_lists_every_descriptor() {
        let table = vec![
            ProcessDescriptor { slot: 0, pid: 101, command_count: 4, start_time: 0, last_command_time: 60 },
            ProcessDescriptor { slot: 2, pid: 202, command_count: 0, start_time: 0, last_command_time: 0 },
        ];
        let text = render(|out| processes(out, 2, &table));
        assert!(text.starts_with("2 client(s) connected.\n"));
        assert!(text.contains(&format!("101 |   4 | {} | {}", local_time(0), local_time(60))));
        assert!(text.contains("202 |   0 |"));
    }

    #[test]
    fn local_time_has_date_and_clock() {
        let s = local_time(1_600_000_000);
        assert_eq!(s.len(), "2020-09-13.12:26:40".len());
        assert_eq!(&s[4..5], "-");
        assert_eq!(&s[10..11], ".");
    }
}
