/*
 * Copyright (C) 2025-2026 the tidepool authors.
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

//! Assets compiled into the server binary, served ahead of the static path.

pub struct EmbeddedContent {
    pub data: &'static [u8],
}

const ERROR_TEMPLATE: &str = "<!DOCTYPE html>\n\
<html>\n\
<head><title>%%ERRORCODE%% - %%MESSAGE%%</title></head>\n\
<body>\n\
<h1>%%ERRORCODE%% - %%MESSAGE%%</h1>\n\
<div>%%BODY%%</div>\n\
<hr/>\n\
<div><i>Powered by tidepool</i></div>\n\
</body>\n\
</html>\n";

static CONTENT: &[(&str, EmbeddedContent)] = &[(
    "/_error.html",
    EmbeddedContent {
        data: ERROR_TEMPLATE.as_bytes(),
    },
)];

pub fn find_embedded_content(path: &str) -> Option<&'static EmbeddedContent> {
    for (name, content) in CONTENT {
        if *name == path {
            return Some(content);
        }
    }

    None
}
