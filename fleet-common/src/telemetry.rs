// This file is part of wallet-fleet.
// Copyright (C) 2025 Midnight Foundation
// SPDX-License-Identifier: Apache-2.0
// Licensed under the Apache License, Version 2.0 (the "License");
// You may not use this file except in compliance with the License.
// You may obtain a copy of the License at
// http://www.apache.org/licenses/LICENSE-2.0
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use log::LevelFilter;
use logforth::append;
use logforth::record::Level as LogforthLevel;
use logforth::record::LevelFilter as LogforthLevelFilter;
use std::sync::Once;

static INIT: Once = Once::new();

fn to_logforth_level_filter(level: LevelFilter) -> LogforthLevelFilter {
    match level {
        LevelFilter::Off => LogforthLevelFilter::Off,
        LevelFilter::Error => LogforthLevelFilter::MoreSevereEqual(LogforthLevel::Error),
        LevelFilter::Warn => LogforthLevelFilter::MoreSevereEqual(LogforthLevel::Warn),
        LevelFilter::Info => LogforthLevelFilter::MoreSevereEqual(LogforthLevel::Info),
        LevelFilter::Debug => LogforthLevelFilter::MoreSevereEqual(LogforthLevel::Debug),
        LevelFilter::Trace => LogforthLevelFilter::All,
    }
}

/// Initialize process-wide logging to stderr at the given level. Safe to call more than once;
/// only the first call takes effect.
pub fn init_logging(level: LevelFilter) {
    INIT.call_once(|| {
        logforth::starter_log::builder()
            .dispatch(|dispatch| {
                dispatch
                    .filter(to_logforth_level_filter(level))
                    .append(append::Stderr::default())
            })
            .apply();
    });
}
