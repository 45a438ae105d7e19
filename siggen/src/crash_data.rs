//! The crash-data input document.
//!
//! This is the normalized mapping an upstream processor produces for one
//! crash report: the stackwalker's threads/frames plus a grab bag of
//! annotations the individual rules consult. All fields are optional; rules
//! treat missing data as "nothing to do".
//!
//! Some annotation fields show up as numbers in one pipeline and as strings
//! in another, so those deserialize leniently instead of failing the whole
//! document.

use std::convert::TryFrom;

use serde::de::Deserializer;
use serde::Deserialize;
use serde_json::Value;

/// One crash report's worth of data, deserialized from the processor's JSON.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CrashData {
    /// Index into `threads` of the thread that crashed. Absent means no
    /// signature can be derived from the stack.
    #[serde(deserialize_with = "lenient_usize")]
    pub crashing_thread: Option<usize>,
    pub threads: Vec<Thread>,
    /// Operating system name, e.g. "Windows NT", "Linux", "Mac OS X".
    pub os: Option<String>,
    pub cpu_arch: Option<String>,
    pub java_stack_trace: Option<String>,
    pub abort_message: Option<String>,
    /// JSON blob describing an AsyncShutdown hang: `{"phase": ...,
    /// "conditions": [...]}`.
    pub async_shutdown_timeout: Option<String>,
    pub jit_category: Option<String>,
    pub ipc_channel_error: Option<String>,
    pub ipc_message_name: Option<String>,
    /// "browser" when the browser process produced additional minidumps for
    /// this crash.
    pub additional_minidumps: Option<String>,
    /// Status string from the minidump stackwalker, non-OK when it had
    /// trouble.
    pub mdsw_status_string: Option<String>,
    pub moz_crash_reason: Option<String>,
    /// Size of the allocation that failed, for OOM crashes. Arrives as a
    /// number or a numeric string.
    #[serde(deserialize_with = "lenient_string")]
    pub oom_allocation_size: Option<String>,
    /// -1 for a plugin hang, 1 for a browser (chrome) hang, 0/absent
    /// otherwise.
    #[serde(deserialize_with = "lenient_i64")]
    pub hang_type: Option<i64>,
}

/// One thread's stack.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Thread {
    pub frames: Vec<Frame>,
}

/// One stack frame, in the stackwalker's field names. Frame 0 is the
/// innermost (crashing) frame.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Frame {
    pub function: Option<String>,
    pub module: Option<String>,
    pub module_offset: Option<String>,
    pub file: Option<String>,
    #[serde(deserialize_with = "lenient_u32")]
    pub line: Option<u32>,
    pub offset: Option<String>,
    pub unloaded_modules: Vec<UnloadedModule>,
}

/// A module that was unloaded but whose address range covers the frame.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct UnloadedModule {
    pub module: Option<String>,
    pub offsets: Vec<String>,
}

// The lenient deserializers below accept the value either in its natural
// type or stringified, and treat anything unusable as absent rather than
// failing deserialization of the whole crash report.

fn lenient_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::String(s)) => Some(s),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

fn lenient_u64_value(value: Option<Value>) -> Option<u64> {
    match value {
        Some(Value::Number(n)) => n.as_u64(),
        Some(Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    }
}

fn lenient_usize<'de, D>(deserializer: D) -> Result<Option<usize>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(lenient_u64_value(value).map(|n| n as usize))
}

fn lenient_u32<'de, D>(deserializer: D) -> Result<Option<u32>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(lenient_u64_value(value).and_then(|n| u32::try_from(n).ok()))
}

fn lenient_i64<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::Number(n)) => n.as_i64(),
        Some(Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document() {
        let crash_data: CrashData = serde_json::from_str("{}").unwrap();
        assert!(crash_data.crashing_thread.is_none());
        assert!(crash_data.threads.is_empty());
        assert!(crash_data.java_stack_trace.is_none());
    }

    #[test]
    fn test_frames() {
        let crash_data: CrashData = serde_json::from_str(
            r#"{
                "crashing_thread": 0,
                "os": "Windows NT",
                "threads": [
                    {
                        "frames": [
                            {
                                "frame": 0,
                                "function": "NtWaitForMultipleObjects",
                                "module": "ntdll.dll",
                                "module_offset": "0x2015d",
                                "offset": "0x77ad015d",
                                "trust": "context"
                            },
                            {
                                "frame": 1,
                                "file": "hg:hg.mozilla.org/mozilla-central:xpcom/threads/nsThread.cpp:deadbeef",
                                "line": 118
                            }
                        ]
                    }
                ]
            }"#,
        )
        .unwrap();
        assert_eq!(crash_data.crashing_thread, Some(0));
        let frames = &crash_data.threads[0].frames;
        assert_eq!(frames[0].function.as_deref(), Some("NtWaitForMultipleObjects"));
        assert_eq!(frames[1].line, Some(118));
    }

    #[test]
    fn test_lenient_fields() {
        let crash_data: CrashData = serde_json::from_str(
            r#"{
                "crashing_thread": "2",
                "oom_allocation_size": 262145,
                "hang_type": "-1"
            }"#,
        )
        .unwrap();
        assert_eq!(crash_data.crashing_thread, Some(2));
        assert_eq!(crash_data.oom_allocation_size.as_deref(), Some("262145"));
        assert_eq!(crash_data.hang_type, Some(-1));

        // Garbage in a lenient field reads as absent, not as an error.
        let crash_data: CrashData =
            serde_json::from_str(r#"{"crashing_thread": [], "hang_type": "x"}"#).unwrap();
        assert!(crash_data.crashing_thread.is_none());
        assert!(crash_data.hang_type.is_none());
    }
}
